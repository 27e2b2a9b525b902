//! Declarative VM spec: schema, merge algebra, and validation.
//!
//! A `VMSpec` is built once from the defaults baked into the image,
//! merged exactly once with the spec fetched from instance metadata
//! (the fetched side wins), validated, and then treated as immutable
//! for the remainder of boot.

use serde::{Deserialize, Serialize};

use crate::errors::{MultiError, PreinitError, PreinitResult};

/// Configuration for a VM's workload and environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VMSpec {
    pub args: Vec<String>,
    pub command: Vec<String>,
    pub env: NameValueSource,
    pub env_from: Vec<EnvFrom>,
    pub security: SecurityContext,
    pub volumes: Vec<Volume>,
    pub working_dir: String,
    pub sysctls: NameValueSource,
}

impl VMSpec {
    /// Right-biased merge: `other` wins on every field it defines,
    /// but cannot unset a field. Lists and strings are replaced only
    /// when non-empty in `other`, booleans only when true, ids only
    /// when non-zero. Env entries are merged per name.
    pub fn merge(&self, other: &VMSpec) -> VMSpec {
        let mut merged = self.clone();

        if !other.args.is_empty() {
            merged.args = other.args.clone();
        }
        if !other.command.is_empty() {
            merged.command = other.command.clone();
        }

        merged.env = self.env.merge(&other.env);

        if other.security.readonly_root_fs {
            merged.security.readonly_root_fs = true;
        }
        if other.security.run_as_group_id != 0 {
            merged.security.run_as_group_id = other.security.run_as_group_id;
        }
        if other.security.run_as_user_id != 0 {
            merged.security.run_as_user_id = other.security.run_as_user_id;
        }

        if !other.working_dir.is_empty() {
            merged.working_dir = other.working_dir.clone();
        }
        if !other.volumes.is_empty() {
            merged.volumes = other.volumes.clone();
        }
        if !other.env_from.is_empty() {
            merged.env_from = other.env_from.clone();
        }
        if !other.sysctls.is_empty() {
            merged.sysctls = other.sysctls.clone();
        }

        merged
    }

    /// Reject ambiguous specs. All entry-level failures are collected
    /// so the boot log shows every problem at once.
    pub fn validate(&self) -> PreinitResult<()> {
        let mut errs = MultiError::default();
        for ef in &self.env_from {
            if let Err(err) = ef.validate() {
                errs.push(err);
            }
        }
        for volume in &self.volumes {
            if let Err(err) = volume.validate() {
                errs.push(err);
            }
        }
        errs.into_result().map_err(PreinitError::from)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

/// An ordered list of unique-name value pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NameValueSource(Vec<NameValue>);

impl NameValueSource {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NameValue> {
        self.0.iter()
    }

    pub fn find(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }

    /// Merge `other` over `self`. Overriding entries come first in the
    /// result, followed by entries of `self` whose names `other` does
    /// not define.
    pub fn merge(&self, other: &NameValueSource) -> NameValueSource {
        let mut merged = other.0.clone();
        merged.extend(
            self.0
                .iter()
                .filter(|item| other.find(&item.name).is_none())
                .cloned(),
        );
        NameValueSource(merged)
    }

    /// Return a copy with `prefix` prepended to every name.
    pub fn with_prefix(&self, prefix: &str) -> NameValueSource {
        if prefix.is_empty() {
            return self.clone();
        }
        NameValueSource(
            self.0
                .iter()
                .map(|item| NameValue {
                    name: format!("{}{}", prefix, item.name),
                    value: item.value.clone(),
                })
                .collect(),
        )
    }

    /// Render as `NAME=VALUE` strings for a process environment.
    pub fn to_env_strings(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|item| format!("{}={}", item.name, item.value))
            .collect()
    }
}

impl From<Vec<NameValue>> for NameValueSource {
    fn from(items: Vec<NameValue>) -> Self {
        NameValueSource(items)
    }
}

impl FromIterator<(String, String)> for NameValueSource {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        NameValueSource(
            iter.into_iter()
                .map(|(name, value)| NameValue { name, value })
                .collect(),
        )
    }
}

/// An indirect environment source resolved from an external store.
/// Exactly one of the source fields must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnvFrom {
    pub prefix: String,
    pub s3_object: Option<S3ObjectEnvSource>,
    pub secrets_manager: Option<SecretsManagerEnvSource>,
    pub ssm_parameter: Option<SsmParameterEnvSource>,
}

impl EnvFrom {
    pub fn validate(&self) -> Result<(), PreinitError> {
        let sources = self.s3_object.is_some() as usize
            + self.secrets_manager.is_some() as usize
            + self.ssm_parameter.is_some() as usize;
        if sources != 1 {
            return Err(PreinitError::Validation(format!(
                "expected 1 environment source, got {}",
                sources
            )));
        }
        Ok(())
    }

    /// Whether the configured source tolerates resolution failure.
    pub fn optional(&self) -> bool {
        self.s3_object.as_ref().map(|s| s.optional).unwrap_or(false)
            || self
                .secrets_manager
                .as_ref()
                .map(|s| s.optional)
                .unwrap_or(false)
            || self
                .ssm_parameter
                .as_ref()
                .map(|s| s.optional)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct S3ObjectEnvSource {
    pub bucket: String,
    pub object: String,
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecretsManagerEnvSource {
    pub name: String,
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SsmParameterEnvSource {
    pub path: String,
    pub optional: bool,
}

/// A volume to make available to the workload. Exactly one of the
/// source fields must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Volume {
    pub ebs: Option<EbsVolumeSource>,
    pub secrets_manager: Option<SecretsManagerVolumeSource>,
}

impl Volume {
    pub fn validate(&self) -> Result<(), PreinitError> {
        let sources = self.ebs.is_some() as usize + self.secrets_manager.is_some() as usize;
        if sources != 1 {
            return Err(PreinitError::Validation(format!(
                "expected 1 volume source, got {}",
                sources
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EbsVolumeSource {
    pub attach: bool,
    pub device: String,
    pub fs_type: String,
    pub make_fs: bool,
    pub mount: Mount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecretsManagerVolumeSource {
    pub name: String,
    pub mount_point: Mount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    pub directory: String,
    #[serde(rename = "group")]
    pub group_id: u32,
    pub mode: String,
    pub options: Vec<String>,
    #[serde(rename = "owner")]
    pub user_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecurityContext {
    pub readonly_root_fs: bool,
    pub run_as_group_id: u32,
    pub run_as_user_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> NameValueSource {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn sample_spec() -> VMSpec {
        VMSpec {
            args: vec!["--port".into(), "8080".into()],
            command: vec!["/app/server".into()],
            env: pairs(&[("A", "1"), ("B", "2")]),
            security: SecurityContext {
                readonly_root_fs: true,
                run_as_group_id: 100,
                run_as_user_id: 1000,
            },
            working_dir: "/app".into(),
            sysctls: pairs(&[("vm.swappiness", "0")]),
            ..VMSpec::default()
        }
    }

    #[test]
    fn test_merge_empty_is_identity() {
        let base = sample_spec();
        assert_eq!(base.merge(&VMSpec::default()), base);
    }

    #[test]
    fn test_merge_override_wins_where_set() {
        let base = sample_spec();
        let other = VMSpec {
            command: vec!["/bin/sleep".into()],
            working_dir: "/tmp".into(),
            security: SecurityContext {
                run_as_user_id: 2000,
                ..SecurityContext::default()
            },
            ..VMSpec::default()
        };

        let merged = base.merge(&other);
        assert_eq!(merged.command, other.command);
        assert_eq!(merged.working_dir, other.working_dir);
        assert_eq!(merged.security.run_as_user_id, 2000);
        // Fields other does not set keep the base values.
        assert_eq!(merged.args, base.args);
        assert_eq!(merged.sysctls, base.sysctls);
        assert_eq!(merged.security.run_as_group_id, 100);
    }

    #[test]
    fn test_merge_cannot_unset() {
        let base = sample_spec();
        let other = VMSpec {
            security: SecurityContext {
                readonly_root_fs: false,
                run_as_group_id: 0,
                run_as_user_id: 0,
            },
            ..VMSpec::default()
        };

        let merged = base.merge(&other);
        assert!(merged.security.readonly_root_fs);
        assert_eq!(merged.security.run_as_group_id, 100);
        assert_eq!(merged.security.run_as_user_id, 1000);
        assert_eq!(merged.command, base.command);
    }

    #[test]
    fn test_name_value_merge_override_sorts_first() {
        let base = pairs(&[("A", "1"), ("B", "2")]);
        let other = pairs(&[("B", "9"), ("C", "3")]);
        let merged = base.merge(&other);
        assert_eq!(merged, pairs(&[("B", "9"), ("C", "3"), ("A", "1")]));
    }

    #[test]
    fn test_name_value_merge_empty_other() {
        let base = pairs(&[("A", "1")]);
        assert_eq!(base.merge(&NameValueSource::default()), base);
    }

    #[test]
    fn test_env_strings() {
        let env = pairs(&[("PORT", "8080")]);
        assert_eq!(env.to_env_strings(), vec!["PORT=8080".to_string()]);
    }

    #[test]
    fn test_env_from_source_counts() {
        let none = EnvFrom::default();
        assert!(none.validate().is_err());

        let one = EnvFrom {
            secrets_manager: Some(SecretsManagerEnvSource {
                name: "db-credentials".into(),
                optional: false,
            }),
            ..EnvFrom::default()
        };
        assert!(one.validate().is_ok());

        let two = EnvFrom {
            s3_object: Some(S3ObjectEnvSource::default()),
            ssm_parameter: Some(SsmParameterEnvSource::default()),
            ..EnvFrom::default()
        };
        assert!(two.validate().is_err());

        let three = EnvFrom {
            s3_object: Some(S3ObjectEnvSource::default()),
            secrets_manager: Some(SecretsManagerEnvSource::default()),
            ssm_parameter: Some(SsmParameterEnvSource::default()),
            ..EnvFrom::default()
        };
        assert!(three.validate().is_err());
    }

    #[test]
    fn test_volume_source_counts() {
        assert!(Volume::default().validate().is_err());

        let ebs = Volume {
            ebs: Some(EbsVolumeSource {
                device: "/dev/sdf".into(),
                ..EbsVolumeSource::default()
            }),
            ..Volume::default()
        };
        assert!(ebs.validate().is_ok());

        let both = Volume {
            ebs: Some(EbsVolumeSource::default()),
            secrets_manager: Some(SecretsManagerVolumeSource::default()),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_spec_validate_collects_all_failures() {
        let spec = VMSpec {
            env_from: vec![EnvFrom::default()],
            volumes: vec![Volume::default()],
            ..VMSpec::default()
        };
        match spec.validate() {
            Err(PreinitError::Aggregate(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_yaml_spec() {
        let doc = r#"
command: ["/app/server"]
args: ["--port", "8080"]
working-dir: /app
env:
  - name: PORT
    value: "8080"
env-from:
  - prefix: DB_
    secrets-manager:
      name: db-credentials
      optional: true
security:
  readonly-root-fs: true
  run-as-user-id: 1000
volumes:
  - ebs:
      device: /dev/sdf
      fs-type: ext4
      make-fs: true
      mount:
        directory: /data
        owner: 1000
        group: 1000
        mode: "0755"
sysctls:
  - name: net.ipv4.ip-local-port-range
    value: "1024 65535"
"#;
        let spec: VMSpec = serde_yaml::from_str(doc).unwrap();
        assert_eq!(spec.command, vec!["/app/server"]);
        assert_eq!(spec.env.find("PORT"), Some("8080"));
        assert!(spec.security.readonly_root_fs);
        assert_eq!(spec.env_from.len(), 1);
        assert!(spec.env_from[0].optional());
        let ebs = spec.volumes[0].ebs.as_ref().unwrap();
        assert_eq!(ebs.mount.directory, "/data");
        assert_eq!(ebs.mount.user_id, 1000);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_with_prefix() {
        let env = pairs(&[("USER", "admin")]);
        let prefixed = env.with_prefix("DB_");
        assert_eq!(prefixed.find("DB_USER"), Some("admin"));
        assert!(prefixed.find("USER").is_none());
    }
}
