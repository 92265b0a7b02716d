//! Task trait - 関数名と引数型の対応付け
//!
//! # 学習ポイント
//! - Associated Constants (`const FUNCTION`, `const BROKEN_REASONS`)
//! - Trait bounds の組み合わせ (DeserializeOwned + Send + Sync + 'static)

use serde::de::DeserializeOwned;

use crate::domain::{Arg, TaskSpec};

/// Task は関数名と引数の型を対応付ける
///
/// 引数は位置引数のリストとして保存されます。`args()` がリストを作り、
/// 実行時は同じリストを JSON 配列として `Self` にデシリアライズします
/// （blob 引数はその hex 文字列として渡ります）。
///
/// # 使用例
/// ```ignore
/// #[derive(Deserialize)]
/// struct Extract {
///     archive: BlobId,
/// }
///
/// impl Task for Extract {
///     const FUNCTION: &'static str = "archives.extract";
///     const BROKEN_REASONS: &'static [&'static str] = &["corrupt_archive"];
///
///     fn args(&self) -> Vec<Arg> {
///         vec![Arg::blob(self.archive.clone())]
///     }
/// }
/// ```
pub trait Task: DeserializeOwned + Send + Sync + 'static {
    /// Stable function name stored in every task record.
    const FUNCTION: &'static str;

    /// Broken reason codes this function may report, besides the engine's own.
    const BROKEN_REASONS: &'static [&'static str] = &[];

    /// Positional argument list; together with `FUNCTION` this is the task's fingerprint.
    fn args(&self) -> Vec<Arg>;

    fn spec(&self) -> TaskSpec {
        TaskSpec::new(Self::FUNCTION, self.args())
    }
}
