//! Service lifecycle abstraction and built-in services.
//!
//! Every supervised process, auxiliary services and the main workload
//! alike, implements [`Service`]. Built-ins are not statically
//! wired: the supervisor lists the services directory and looks each
//! entry name up in a [`ServiceRegistry`], so a boot image carries
//! only the services it enabled.

mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::errors::{PreinitError, PreinitResult};
use crate::vmspec::{NameValueSource, VMSpec};

pub use supervisor::{Supervisor, SupervisorState};

/// Uniform lifecycle for a supervised process.
#[async_trait]
pub trait Service: Send + Sync {
    /// Spawn the underlying process.
    async fn start(&self) -> PreinitResult<()>;

    /// Request graceful termination. No-op if not running.
    fn stop(&self);

    /// Force termination. No-op if not running.
    fn kill(&self);

    /// Block until the process exits, returning its exit error if any.
    async fn wait(&self) -> PreinitResult<()>;

    /// Whether a start failure may be tolerated at boot.
    fn optional(&self) -> bool;

    /// Human-readable identity for logging.
    fn name(&self) -> &str;
}

/// A service backed by a spawned command.
///
/// Signals are delivered by pid so `stop`/`kill` never contend with a
/// `wait` in progress.
pub struct CommandService {
    name: String,
    argv: Vec<String>,
    env: NameValueSource,
    working_dir: Option<String>,
    uid: Option<u32>,
    gid: Option<u32>,
    optional: bool,
    pid: AtomicU32,
    child: Mutex<Option<Child>>,
}

impl CommandService {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            env: NameValueSource::default(),
            working_dir: None,
            uid: None,
            gid: None,
            optional: false,
            pid: AtomicU32::new(0),
            child: Mutex::new(None),
        }
    }

    pub fn with_env(mut self, env: NameValueSource) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn with_optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// Build the main workload from a merged spec: command plus args,
    /// spec environment, working directory, and run-as identity.
    pub fn from_spec(spec: &VMSpec) -> Self {
        let mut argv = spec.command.clone();
        argv.extend(spec.args.iter().cloned());

        let mut service = Self::new("main", argv).with_env(spec.env.clone());
        if !spec.working_dir.is_empty() {
            service = service.with_working_dir(spec.working_dir.clone());
        }
        if spec.security.run_as_user_id != 0 {
            service.uid = Some(spec.security.run_as_user_id);
        }
        if spec.security.run_as_group_id != 0 {
            service.gid = Some(spec.security.run_as_group_id);
        }
        service
    }

    fn signal(&self, signum: libc::c_int) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        unsafe {
            libc::kill(pid as libc::c_int, signum);
        }
    }
}

#[async_trait]
impl Service for CommandService {
    async fn start(&self) -> PreinitResult<()> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(PreinitError::Validation(format!(
                "service {} has no command",
                self.name
            )));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        for item in self.env.iter() {
            cmd.env(&item.name, &item.value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(uid) = self.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = self.gid {
            cmd.gid(gid);
        }

        let child = cmd.spawn().map_err(|source| PreinitError::ServiceStart {
            name: self.name.clone(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        *self.child.lock().await = Some(child);

        tracing::info!(service = %self.name, pid = pid, "process started");
        Ok(())
    }

    fn stop(&self) {
        self.signal(libc::SIGTERM);
    }

    fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    async fn wait(&self) -> PreinitResult<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };
        let status = child.wait().await?;
        *guard = None;
        // The child is reaped; clear the pid so stop/kill cannot
        // signal a recycled pid.
        self.pid.store(0, Ordering::SeqCst);

        if status.success() {
            Ok(())
        } else {
            Err(PreinitError::ServiceExit {
                name: self.name.clone(),
                status,
            })
        }
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Clock synchronization daemon, in the foreground. Optional: a boot
/// without working time sync is degraded, not broken.
fn chrony() -> Arc<dyn Service> {
    Arc::new(
        CommandService::new("chrony", vec!["/usr/sbin/chronyd".into(), "-d".into()])
            .with_optional(true),
    )
}

/// SSH daemon, in the foreground with errors to stderr.
fn sshd() -> Arc<dyn Service> {
    Arc::new(CommandService::new(
        "ssh",
        vec!["/usr/sbin/sshd".into(), "-D".into(), "-e".into()],
    ))
}

type ServiceFactory = Box<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// Mapping from recognized service name to factory. Discovery becomes
/// a pure lookup with an "unrecognized" fallback.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<String, ServiceFactory>,
}

impl ServiceRegistry {
    /// Registry with the built-in services.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("chrony", chrony);
        registry.register("ssh", sshd);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Service> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.factories.get(name).map(|factory| factory())
    }
}
