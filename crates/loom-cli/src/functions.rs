//! Demo functions: split a text "archive" into documents and convert each.
//!
//! An archive is UTF-8 text where every document starts with a `--- <name>`
//! line. `demo.extract` stores each document as a blob and spawns one
//! `demo.convert` child per document; `demo.convert` upper-cases its input.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use loom_core::app::EngineBuilder;
use loom_core::domain::{Arg, BlobId, TaskError};
use loom_core::typed::{Handler, RegistryError, Task, TaskContext};

pub const ALL: &[&str] = &[Extract::FUNCTION, Convert::FUNCTION];

#[derive(Debug, Clone, Deserialize)]
pub struct Extract {
    pub archive: BlobId,
}

impl Task for Extract {
    const FUNCTION: &'static str = "demo.extract";
    const BROKEN_REASONS: &'static [&'static str] = &["empty_archive", "not_utf8"];

    fn args(&self) -> Vec<Arg> {
        vec![Arg::blob(self.archive.clone())]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Convert {
    pub document: BlobId,
}

impl Task for Convert {
    const FUNCTION: &'static str = "demo.convert";
    const BROKEN_REASONS: &'static [&'static str] = &["not_utf8"];

    fn args(&self) -> Vec<Arg> {
        vec![Arg::blob(self.document.clone())]
    }
}

/// Listing stored as the result of `demo.extract`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub documents: Vec<ListingEntry>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ListingEntry {
    pub name: String,
    pub blob: BlobId,
}

pub struct ExtractHandler;

#[async_trait]
impl Handler<Extract> for ExtractHandler {
    async fn handle(
        &self,
        task: Extract,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let bytes = ctx.read_blob(&task.archive).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| TaskError::broken("not_utf8", e.to_string()))?;

        let documents = split_archive(&text);
        if documents.is_empty() {
            return Err(TaskError::broken(
                "empty_archive",
                "archive contains no `--- <name>` sections",
            ));
        }

        let mut listing = Listing {
            documents: Vec::with_capacity(documents.len()),
        };
        for (name, body) in documents {
            let blob = ctx.put_blob(body.into_bytes()).await?;
            ctx.spawn(
                format!("{name}-extracted"),
                Convert {
                    document: blob.clone(),
                }
                .spec(),
            );
            ctx.log(format!("extracted {name}"));
            listing.documents.push(ListingEntry { name, blob });
        }

        let listing = serde_json::to_vec(&listing)?;
        Ok(Some(ctx.put_blob(listing).await?))
    }
}

pub struct ConvertHandler;

#[async_trait]
impl Handler<Convert> for ConvertHandler {
    async fn handle(
        &self,
        task: Convert,
        ctx: &mut TaskContext,
    ) -> Result<Option<BlobId>, TaskError> {
        let bytes = ctx.read_blob(&task.document).await?;
        let text = String::from_utf8(bytes)
            .map_err(|e| TaskError::broken("not_utf8", e.to_string()))?;
        Ok(Some(ctx.put_blob(text.to_uppercase().into_bytes()).await?))
    }
}

pub fn register(builder: EngineBuilder) -> Result<EngineBuilder, RegistryError> {
    builder
        .register::<Extract, _>(ExtractHandler)?
        .register::<Convert, _>(ConvertHandler)
}

/// `(name, body)` per `--- name` section; text before the first header is ignored.
fn split_archive(text: &str) -> Vec<(String, String)> {
    let mut documents: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if let Some(name) = line.strip_prefix("--- ") {
            documents.push((name.trim().to_string(), String::new()));
        } else if let Some((_, body)) = documents.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    documents
}
