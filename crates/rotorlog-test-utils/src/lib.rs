// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the rotorlog crates.

use std::{
    future::Future,
    io::Write as _,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Macro for creating parametrized tests.
///
/// Accepts the name of an existing test function followed by a list of case names with their
/// arguments, and expands to a module containing a `#[test]` function per case. An optional
/// return type can be given after the function name for fallible tests.
///
/// # Example
///
/// ```
/// # use rotorlog_test_utils::param_test;
/// param_test! {
///     test_sum: [
///         positive: (10, 7, 17),
///         negative: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// # fn main() {}
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> (): [ $( $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Async variant of [`param_test!`]; each case expands to a `#[tokio::test]` function.
#[macro_export]
macro_rules! async_param_test {
    ($func_name:ident: [
        $( $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[tokio::test]
                async fn $case_name() {
                    $func_name($($args),*).await
                }
            )*
        }
    };
}

/// Creates a bag segment file at `path` containing one row in the `messages` table per entry in
/// `timestamps`.
///
/// The schema mirrors the parts of the sqlite3 storage plugin's layout that the service reads.
/// An empty `timestamps` slice produces a valid bag with no messages.
pub fn create_bag_file(path: &Path, timestamps: &[i64]) -> Result {
    let connection = rusqlite::Connection::open(path)?;
    connection.execute_batch(
        "CREATE TABLE topics (id INTEGER PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL);
         CREATE TABLE messages (
             id INTEGER PRIMARY KEY,
             topic_id INTEGER NOT NULL,
             timestamp INTEGER NOT NULL,
             data BLOB NOT NULL
         );",
    )?;
    for (index, timestamp) in timestamps.iter().enumerate() {
        connection.execute(
            "INSERT INTO messages (id, topic_id, timestamp, data) VALUES (?1, 1, ?2, x'2a')",
            rusqlite::params![index as i64 + 1, timestamp],
        )?;
    }
    Ok(())
}

/// Writes an executable shell script to `dir` that can stand in for the external segment writer.
///
/// The script body receives the writer's argument vector; `$0` is the script path itself.
pub fn fake_writer_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "#!/bin/sh")?;
    file.write_all(body.as_bytes())?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

/// A deterministic ES256 signing key in PKCS#8 PEM form.
pub fn test_signing_key_pem() -> String {
    use p256::pkcs8::{EncodePrivateKey, LineEnding};

    let key = p256::SecretKey::random(&mut StdRng::seed_from_u64(42));
    key.to_pkcs8_pem(LineEnding::LF)
        .expect("generated key can be serialized as PEM")
        .to_string()
}

/// The public half of [`test_signing_key_pem`] in SPKI PEM form.
pub fn test_verifying_key_pem() -> String {
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    let key = p256::SecretKey::random(&mut StdRng::seed_from_u64(42));
    key.public_key()
        .to_public_key_pem(LineEnding::LF)
        .expect("generated key can be serialized as PEM")
}

/// Polls `condition` every 10 ms until it returns true or `timeout` elapses.
///
/// Returns whether the condition was observed to hold.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    param_test! {
        saturating_add: [
            no_overflow: (1u8, 2, 3),
            overflow: (200u8, 100, u8::MAX),
        ]
    }
    fn saturating_add(lhs: u8, rhs: u8, expected: u8) {
        assert_eq!(lhs.saturating_add(rhs), expected);
    }

    #[test]
    fn bag_file_contains_requested_timestamps() -> Result {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fixture_0.db3");
        create_bag_file(&path, &[30, 10, 20])?;

        let connection = rusqlite::Connection::open(&path)?;
        let minimum: i64 =
            connection.query_row("SELECT min(timestamp) FROM messages", [], |row| row.get(0))?;
        assert_eq!(minimum, 10);
        Ok(())
    }

    #[test]
    fn signing_key_is_deterministic() {
        assert_eq!(test_signing_key_pem(), test_signing_key_pem());
        assert!(test_signing_key_pem().contains("PRIVATE KEY"));
        assert!(test_verifying_key_pem().contains("PUBLIC KEY"));
    }
}
