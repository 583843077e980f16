#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use courier_core::AgentFacade;
use courier_core::config::Config;
use courier_core::config::ConfigToml;

/// Write a fake agent: a shell script that plays back the wire protocol on
/// stdout. The prompt arrives as the last positional argument, so scripts
/// can branch on it.
pub fn write_agent_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

pub struct FacadeOptions {
    pub timeout_seconds: u64,
    pub allowed_tools: Vec<String>,
}

impl Default for FacadeOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            allowed_tools: Vec::new(),
        }
    }
}

/// Facade wired to the primary CLI back-end with the given fake agent
/// binary.
pub fn facade_for_script(root: &Path, script: &Path, options: FacadeOptions) -> Arc<AgentFacade> {
    let mut config = Config::from_toml(ConfigToml {
        approved_directory: Some(root.to_path_buf()),
        agent_timeout_seconds: Some(options.timeout_seconds),
        allowed_tools: Some(options.allowed_tools),
        ..Default::default()
    })
    .unwrap();
    config.primary.binary = Some(script.to_path_buf());
    Arc::new(AgentFacade::new(Arc::new(config)))
}
