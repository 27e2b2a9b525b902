//! Boot orchestration: spec acquisition through supervised shutdown.
//!
//! The sequence is: load the defaults baked into the image, fetch
//! user data from instance metadata, merge (fetched side wins),
//! validate, resolve indirect environment sources, provision volumes,
//! apply sysctls, then hand the workload to the supervisor. Boot-time
//! errors unwind the whole sequence; shutdown-time errors only
//! annotate the terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::constants;
use crate::errors::PreinitResult;
use crate::imds::ImdsClient;
use crate::service::{CommandService, ServiceRegistry, Supervisor, SupervisorState};
use crate::sysctl::SysctlApplier;
use crate::vmspec::{EnvFrom, NameValueSource, VMSpec, Volume};

/// Executes a fully parsed volume entry: attach, make filesystem,
/// mount. The preinit core only parses and dispatches.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    async fn provision(&self, volume: &Volume) -> PreinitResult<()>;
}

/// Resolves a fully parsed env-from entry into name/value pairs from
/// its external store.
#[async_trait]
pub trait EnvFromResolver: Send + Sync {
    async fn resolve(&self, source: &EnvFrom) -> PreinitResult<NameValueSource>;
}

/// Everything boot needs, passed explicitly so tests can substitute
/// endpoints, directories, and collaborators.
pub struct BootConfig {
    pub metadata_endpoint: String,
    pub services_dir: PathBuf,
    pub sysctl_root: PathBuf,
    pub default_spec_path: PathBuf,
    pub shutdown_timeout: Duration,
    pub volume_provisioner: Option<Arc<dyn VolumeProvisioner>>,
    pub env_from_resolver: Option<Arc<dyn EnvFromResolver>>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            metadata_endpoint: constants::ENDPOINT_METADATA_DEFAULT.to_string(),
            services_dir: PathBuf::from(constants::DIR_SERVICES),
            sysctl_root: PathBuf::from(constants::DIR_PROC_SYS),
            default_spec_path: PathBuf::from(constants::PATH_DEFAULT_SPEC),
            shutdown_timeout: constants::SHUTDOWN_TIMEOUT,
            volume_provisioner: None,
            env_from_resolver: None,
        }
    }
}

/// Run the boot sequence to its terminal state.
pub async fn run(config: BootConfig) -> PreinitResult<SupervisorState> {
    let spec = prepare_spec(&config).await?;

    if let Some(provisioner) = &config.volume_provisioner {
        for volume in &spec.volumes {
            provisioner.provision(volume).await?;
        }
    }

    if !spec.sysctls.is_empty() {
        let applier = SysctlApplier::with_root(&config.sysctl_root);
        // Per-unit failures are not fatal to boot.
        if let Err(errs) = applier.apply(&spec.sysctls).await {
            for err in errs.errors() {
                tracing::warn!(error = %err, "sysctl not applied");
            }
        }
    }

    if spec.security.readonly_root_fs {
        remount_root_readonly()?;
    }

    let main = Arc::new(CommandService::from_spec(&spec));
    let mut supervisor = Supervisor::new(
        main,
        ServiceRegistry::builtin(),
        config.services_dir.clone(),
        config.shutdown_timeout,
    );
    supervisor.start().await?;

    let state = supervisor.wait().await?;
    tracing::info!(state = ?state, "supervisor reached terminal state");
    Ok(state)
}

/// Defaults, merge, validate, env-from resolution. Split out so tests
/// can exercise spec preparation without spawning processes.
async fn prepare_spec(config: &BootConfig) -> PreinitResult<VMSpec> {
    let defaults = load_default_spec(&config.default_spec_path).await?;

    let imds = ImdsClient::with_endpoint(config.metadata_endpoint.clone());
    let fetched = imds.fetch_user_data().await?;

    let mut spec = defaults.merge(&fetched);
    spec.validate()?;

    if let Some(resolver) = &config.env_from_resolver {
        spec.env = resolve_env_from(resolver.as_ref(), &spec).await?;
    }

    Ok(spec)
}

async fn load_default_spec(path: &std::path::Path) -> PreinitResult<VMSpec> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Ok(serde_yaml::from_str(&body)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no default spec in image");
            Ok(VMSpec::default())
        }
        Err(err) => Err(err.into()),
    }
}

/// Resolve every env-from entry in order, later entries overriding
/// earlier ones and explicit env entries overriding them all. A
/// failing optional source is logged; any other failure is fatal.
async fn resolve_env_from(
    resolver: &dyn EnvFromResolver,
    spec: &VMSpec,
) -> PreinitResult<NameValueSource> {
    let mut resolved = NameValueSource::default();
    for source in &spec.env_from {
        match resolver.resolve(source).await {
            Ok(vars) => {
                resolved = resolved.merge(&vars.with_prefix(&source.prefix));
            }
            Err(err) if source.optional() => {
                tracing::warn!(error = %err, "optional environment source not resolved");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(resolved.merge(&spec.env))
}

#[cfg(target_os = "linux")]
fn remount_root_readonly() -> PreinitResult<()> {
    use nix::mount::{MsFlags, mount};
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|err| {
        crate::errors::PreinitError::Internal(format!("unable to remount root read-only: {}", err))
    })?;
    tracing::info!("root filesystem remounted read-only");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn remount_root_readonly() -> PreinitResult<()> {
    tracing::warn!("readonly root requested, not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PreinitError;
    use crate::vmspec::{NameValue, SecretsManagerEnvSource};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeResolver;

    #[async_trait]
    impl EnvFromResolver for FakeResolver {
        async fn resolve(&self, source: &EnvFrom) -> PreinitResult<NameValueSource> {
            if let Some(sm) = &source.secrets_manager {
                if sm.name == "missing" {
                    return Err(PreinitError::Internal("secret not found".into()));
                }
                return Ok(vec![NameValue {
                    name: "USER".into(),
                    value: "admin".into(),
                }]
                .into());
            }
            Err(PreinitError::Internal("unsupported source".into()))
        }
    }

    fn secrets_entry(name: &str, prefix: &str, optional: bool) -> EnvFrom {
        EnvFrom {
            prefix: prefix.into(),
            secrets_manager: Some(SecretsManagerEnvSource {
                name: name.into(),
                optional,
            }),
            ..EnvFrom::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_env_from_applies_prefix_and_explicit_wins() {
        let spec = VMSpec {
            env: vec![NameValue {
                name: "DB_USER".into(),
                value: "explicit".into(),
            }]
            .into(),
            env_from: vec![
                secrets_entry("db", "DB_", false),
                secrets_entry("other", "", false),
            ],
            ..VMSpec::default()
        };

        let env = resolve_env_from(&FakeResolver, &spec).await.unwrap();
        // Explicit env overrides the resolved DB_USER.
        assert_eq!(env.find("DB_USER"), Some("explicit"));
        assert_eq!(env.find("USER"), Some("admin"));
    }

    #[tokio::test]
    async fn test_resolve_env_from_optional_failure_tolerated() {
        let spec = VMSpec {
            env_from: vec![secrets_entry("missing", "", true)],
            ..VMSpec::default()
        };
        let env = resolve_env_from(&FakeResolver, &spec).await.unwrap();
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_env_from_required_failure_fatal() {
        let spec = VMSpec {
            env_from: vec![secrets_entry("missing", "", false)],
            ..VMSpec::default()
        };
        assert!(resolve_env_from(&FakeResolver, &spec).await.is_err());
    }

    #[tokio::test]
    async fn test_load_default_spec_missing_file() {
        let spec = load_default_spec(std::path::Path::new("/does/not/exist.yaml"))
            .await
            .unwrap();
        assert_eq!(spec, VMSpec::default());
    }

    #[tokio::test]
    async fn test_prepare_spec_merges_user_data_over_defaults() {
        let dir = TempDir::new().unwrap();
        let default_path = dir.path().join("vmspec.yaml");
        std::fs::write(
            &default_path,
            "command: [\"/bin/default\"]\nworking-dir: /srv\n",
        )
        .unwrap();

        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/user-data"))
            .respond_with(ResponseTemplate::new(200).set_body_string("command: [\"/bin/user\"]\n"))
            .mount(&server)
            .await;

        let config = BootConfig {
            metadata_endpoint: server.uri().trim_start_matches("http://").to_string(),
            default_spec_path: default_path,
            ..BootConfig::default()
        };

        let spec = prepare_spec(&config).await.unwrap();
        assert_eq!(spec.command, vec!["/bin/user"]);
        // User data did not touch the working dir, defaults hold.
        assert_eq!(spec.working_dir, "/srv");
    }

    #[tokio::test]
    async fn test_prepare_spec_rejects_ambiguous_user_data() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/user-data"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("env-from:\n  - prefix: X_\n"),
            )
            .mount(&server)
            .await;

        let config = BootConfig {
            metadata_endpoint: server.uri().trim_start_matches("http://").to_string(),
            default_spec_path: PathBuf::from("/does/not/exist.yaml"),
            ..BootConfig::default()
        };

        assert!(matches!(
            prepare_spec(&config).await,
            Err(PreinitError::Aggregate(_))
        ));
    }
}
