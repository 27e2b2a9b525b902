//! Kernel tunable application.
//!
//! Each name/value pair is written concurrently under the control
//! surface root. A failing pair never blocks the others; all failures
//! are aggregated into one `MultiError` for the caller to inspect.

use std::path::PathBuf;

use futures::future::join_all;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::constants;
use crate::errors::{MultiError, PreinitError, PreinitResult};
use crate::vmspec::NameValueSource;

/// Writes sysctl values below a configurable root, `/proc/sys` in
/// production and a temp directory in tests.
pub struct SysctlApplier {
    root: PathBuf,
}

impl SysctlApplier {
    pub fn new() -> Self {
        Self::with_root(constants::DIR_PROC_SYS)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Apply every pair, one task each, unordered. Returns Ok only if
    /// every write succeeded.
    pub async fn apply(&self, sysctls: &NameValueSource) -> Result<(), MultiError> {
        let mut handles = Vec::with_capacity(sysctls.len());
        for item in sysctls.iter() {
            let path = self.key_to_path(&item.name);
            let key = item.name.clone();
            let value = item.value.clone();
            handles.push(tokio::spawn(set_sysctl(path, key, value)));
        }

        let mut errs = MultiError::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errs.push(err),
                Err(err) => errs.push(PreinitError::Internal(format!(
                    "sysctl task panicked: {}",
                    err
                ))),
            }
        }
        errs.into_result()
    }

    /// Dotted key `a.b.c` maps to `<root>/a/b/c`.
    fn key_to_path(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('.', "/"))
    }
}

impl Default for SysctlApplier {
    fn default() -> Self {
        Self::new()
    }
}

async fn set_sysctl(path: PathBuf, key: String, value: String) -> PreinitResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .await
        .map_err(|source| PreinitError::SysctlOpen {
            path: path.clone(),
            source,
        })?;
    file.write_all(value.as_bytes())
        .await
        .map_err(|source| PreinitError::SysctlWrite { key, value, source })?;
    Ok(())
}
