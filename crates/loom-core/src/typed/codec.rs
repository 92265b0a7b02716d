//! ArgsCodec - 保存された引数リストと Task 型の相互変換
//!
//! # デシリアライズフロー
//! 1. `Arg::Value(v)` はそのまま、`Arg::Blob(id)` は hex 文字列に
//! 2. JSON 配列として `T` にデシリアライズ（struct は配列形式も受け付ける）
//! 3. 失敗時は `invalid_arguments` で broken（再実行しても直らない）

use serde_json::Value;

use super::task::Task;
use crate::domain::{Arg, TaskError, reason};

/// Stored argument list as the JSON array the typed decoder sees.
pub fn args_to_value(args: &[Arg]) -> Value {
    Value::Array(
        args.iter()
            .map(|arg| match arg {
                Arg::Value(v) => v.clone(),
                Arg::Blob(id) => Value::String(id.to_string()),
            })
            .collect(),
    )
}

/// Decode a stored argument list into `T`.
pub fn decode_args<T: Task>(args: &[Arg]) -> Result<T, TaskError> {
    serde_json::from_value(args_to_value(args)).map_err(|e| {
        TaskError::broken(
            reason::INVALID_ARGUMENTS,
            format!("arguments do not decode as {}: {e}", T::FUNCTION),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BlobId;
    use crate::typed::task::fixtures::{Digest, Echo};

    #[test]
    fn encoded_args_decode_back() {
        let task = Digest {
            input: BlobId::of_bytes(b"payload"),
            rounds: 2,
        };
        let decoded: Digest = decode_args(&task.args()).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn wrong_arity_is_broken_invalid_arguments() {
        let err = decode_args::<Echo>(&[]).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Broken { ref reason, .. } if reason == "invalid_arguments"
        ));
    }

    #[test]
    fn value_where_blob_expected_is_rejected() {
        let args = vec![Arg::value("not-a-digest"), Arg::value(1)];
        assert!(decode_args::<Digest>(&args).is_err());
    }
}
