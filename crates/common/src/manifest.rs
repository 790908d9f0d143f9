//! Process manifest (`app.yaml`) parsing.
//!
//! The manifest describes how the relay process is deployed: a service name,
//! a fixed instance count, a memory allocation, the environment handed to
//! task handlers and the startup command. Only the fields the dispatcher
//! needs are modelled; anything else in the file is ignored.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Deployment descriptor for the relay process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessManifest {
    /// Service name.
    pub service: String,
    /// Fixed scaling; absent means a single instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_scaling: Option<ManualScaling>,
    /// Resource allocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    /// Opaque key/value pairs consumed by task handlers.
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    /// Startup command, e.g. `gunicorn --workers 1 --threads 50 -b :$PORT app:app`.
    pub entrypoint: String,
}

/// Fixed instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualScaling {
    /// Number of instances.
    pub instances: u32,
}

/// Resource allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory in gigabytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<f64>,
    /// CPU count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
}

impl ProcessManifest {
    /// Parse a manifest from YAML.
    pub fn from_yaml_str(yaml: &str) -> AppResult<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        if manifest.service.trim().is_empty() {
            return Err(AppError::Config("process manifest has an empty service name".into()));
        }
        Ok(manifest)
    }

    /// Read and parse a manifest file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Number of instances the manifest pins the service to.
    #[must_use]
    pub fn instances(&self) -> u32 {
        self.manual_scaling.map_or(1, |s| s.instances)
    }

    /// Parse the startup command.
    pub fn entrypoint(&self) -> AppResult<Entrypoint> {
        Entrypoint::parse(&self.entrypoint)
    }

    /// The injected environment.
    #[must_use]
    pub fn environment(&self) -> Environment {
        Environment::new(self.env_variables.clone())
    }
}

/// Parsed startup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    /// Program name.
    pub program: String,
    /// Worker processes.
    pub workers: usize,
    /// Threads per worker.
    pub threads: usize,
    /// Listening address.
    pub bind: Option<Bind>,
}

/// Listening address from `-b`/`--bind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    /// Host part; empty means all interfaces.
    pub host: String,
    /// Port part.
    pub port: PortSpec,
}

/// A port given literally or through an environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// `:8080`
    Fixed(u16),
    /// `:$PORT`
    Env(String),
}

impl Entrypoint {
    /// Parse a command line such as `gunicorn --workers 1 --threads 50 -b :$PORT app:app`.
    pub fn parse(command: &str) -> AppResult<Self> {
        let mut tokens = command.split_whitespace();
        let program = tokens
            .next()
            .ok_or_else(|| AppError::Config("entrypoint is empty".into()))?
            .to_string();

        let mut entrypoint = Self {
            program,
            workers: 1,
            threads: 1,
            bind: None,
        };

        while let Some(token) = tokens.next() {
            let (flag, inline_value) = match token.split_once('=') {
                Some((flag, value)) if flag.starts_with('-') => (flag, Some(value)),
                _ => (token, None),
            };

            let mut value = |name: &str| -> AppResult<String> {
                inline_value
                    .map(str::to_string)
                    .or_else(|| tokens.next().map(str::to_string))
                    .ok_or_else(|| AppError::Config(format!("entrypoint flag {name} needs a value")))
            };

            match flag {
                "-w" | "--workers" => entrypoint.workers = parse_count(flag, &value(flag)?)?,
                "--threads" => entrypoint.threads = parse_count(flag, &value(flag)?)?,
                "-b" | "--bind" => entrypoint.bind = Some(Bind::parse(&value(flag)?)?),
                _ => {}
            }
        }

        Ok(entrypoint)
    }

    /// Total handler concurrency the command provisions.
    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.workers * self.threads
    }
}

fn parse_count(flag: &str, value: &str) -> AppResult<usize> {
    match value.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(AppError::Config(format!(
            "entrypoint flag {flag} must be a positive integer, got {value:?}"
        ))),
    }
}

impl Bind {
    fn parse(value: &str) -> AppResult<Self> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| AppError::Config(format!("bind address {value:?} has no port")))?;

        let port = if let Some(var) = port.strip_prefix('$') {
            let var = var.trim_start_matches('{').trim_end_matches('}');
            if var.is_empty() {
                return Err(AppError::Config(format!("bind address {value:?} names no variable")));
            }
            PortSpec::Env(var.to_string())
        } else {
            PortSpec::Fixed(port.parse().map_err(|_| {
                AppError::Config(format!("bind address {value:?} has an invalid port"))
            })?)
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host to listen on, or `fallback` when the bind names none.
    #[must_use]
    pub fn host_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.host.is_empty() { fallback } else { &self.host }
    }

    /// Resolve the port, reading the environment through `lookup` if needed.
    pub fn resolve_port<F>(&self, lookup: F) -> AppResult<u16>
    where
        F: Fn(&str) -> Option<String>,
    {
        match &self.port {
            PortSpec::Fixed(port) => Ok(*port),
            PortSpec::Env(var) => {
                let raw = lookup(var)
                    .ok_or_else(|| AppError::Config(format!("port variable {var} is not set")))?;
                raw.parse()
                    .map_err(|_| AppError::Config(format!("port variable {var}={raw:?} is invalid")))
            }
        }
    }
}

/// Environment variables injected once at startup.
///
/// Components receive this explicitly instead of reading the process
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Wrap a set of variables.
    #[must_use]
    pub const fn new(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Look up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no variables are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Substitute every `${NAME}` in `template`.
    pub fn expand(&self, template: &str) -> AppResult<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| AppError::Config(format!("unterminated ${{ in {template:?}")))?;
            let name = &after[..end];
            let value = self
                .get(name)
                .ok_or_else(|| AppError::Config(format!("{name} is not in env_variables")))?;
            out.push_str(value);
            rest = &after[end + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}
