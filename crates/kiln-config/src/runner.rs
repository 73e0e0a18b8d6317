//! Runner configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::config::{
    DEFAULT_BUILDS_DIR, DockerConfig, ExecutorKind, ParallelsConfig, RunnerConfig, SshConfig,
};
use std::path::Path;

/// Read and parse a runner configuration file.
pub fn load_runner_config(path: impl AsRef<Path>) -> ConfigResult<RunnerConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_runner_config(&content)
}

/// Parse a runner configuration from KDL text.
pub fn parse_runner_config(kdl: &str) -> ConfigResult<RunnerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "runner")
        .ok_or_else(|| ConfigError::MissingField("runner".to_string()))?;

    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("runner name".to_string()))?;

    let executor = get_string_prop(node, "executor")
        .ok_or_else(|| ConfigError::MissingField("executor".to_string()))?;
    let executor: ExecutorKind =
        executor
            .parse()
            .map_err(|message| ConfigError::InvalidValue {
                field: "executor".to_string(),
                message,
            })?;

    let mut config = RunnerConfig::new(name, executor);

    if let Some(children) = node.children() {
        config.builds_dir =
            child_string(children, "builds-dir").unwrap_or_else(|| DEFAULT_BUILDS_DIR.to_string());
        config.environment = child_strings(children, "environment");

        for child in children.nodes() {
            match child.name().value() {
                "docker" => config.docker = Some(parse_docker(child)?),
                "parallels" => config.parallels = Some(parse_parallels(child)?),
                "ssh" => config.ssh = Some(parse_ssh(child)?),
                _ => {} // Ignore unknown nodes
            }
        }
    }

    Ok(config)
}

fn parse_docker(node: &KdlNode) -> ConfigResult<DockerConfig> {
    let mut docker = DockerConfig::default();
    let Some(children) = node.children() else {
        return Ok(docker);
    };

    docker.host = child_string(children, "host");
    docker.image = child_string(children, "image").unwrap_or_default();
    docker.registry = child_string(children, "registry");
    docker.hostname = child_string(children, "hostname");
    docker.cache_dir = child_string(children, "cache-dir");
    docker.privileged = child_bool(children, "privileged")?.unwrap_or(false);
    docker.disable_pull = child_bool(children, "disable-pull")?.unwrap_or(false);
    docker.disable_cache = child_bool(children, "disable-cache")?.unwrap_or(false);
    docker.volumes = child_strings(children, "volumes");
    docker.extra_hosts = child_strings(children, "extra-hosts");
    docker.links = child_strings(children, "links");
    docker.services = child_strings(children, "services");

    Ok(docker)
}

fn parse_parallels(node: &KdlNode) -> ConfigResult<ParallelsConfig> {
    let mut parallels = ParallelsConfig::default();
    let Some(children) = node.children() else {
        return Ok(parallels);
    };

    parallels.base_name = child_string(children, "base-name").unwrap_or_default();
    parallels.template_name = child_string(children, "template-name");
    parallels.disable_snapshots = child_bool(children, "disable-snapshots")?.unwrap_or(false);

    Ok(parallels)
}

fn parse_ssh(node: &KdlNode) -> ConfigResult<SshConfig> {
    let mut ssh = SshConfig::default();
    let Some(children) = node.children() else {
        return Ok(ssh);
    };

    ssh.user = child_string(children, "user");
    ssh.identity_file = child_string(children, "identity-file");
    if let Some(port) = children.get("port") {
        let value = node_first_arg(port)
            .and_then(|v| v.as_integer())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "ssh.port".to_string(),
                message: "expected an integer".to_string(),
            })?;
        ssh.port = u16::try_from(value).map_err(|_| ConfigError::InvalidValue {
            field: "ssh.port".to_string(),
            message: format!("{} is out of range", value),
        })?;
    }

    Ok(ssh)
}

// Helper functions for extracting values from KDL nodes

fn node_first_arg(node: &KdlNode) -> Option<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node_first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn child_string(children: &KdlDocument, name: &str) -> Option<String> {
    children.get(name).and_then(get_first_string_arg)
}

/// All string arguments of every child named `name`, so both
/// `volumes "a" "b"` and repeated `volumes "a"` lines work.
fn child_strings(children: &KdlDocument, name: &str) -> Vec<String> {
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == name)
        .flat_map(get_all_string_args)
        .collect()
}

fn child_bool(children: &KdlDocument, name: &str) -> ConfigResult<Option<bool>> {
    let Some(node) = children.get(name) else {
        return Ok(None);
    };
    // A bare flag node means true.
    match node_first_arg(node) {
        None => Ok(Some(true)),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: "expected #true or #false".to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_runner() {
        let kdl = r#"
            runner "docker-1" executor="docker" {
                builds-dir "/builds"
                environment "CI=true" "LANG=C"
                docker {
                    image "ruby:3.3"
                    registry "registry.example.com"
                    cache-dir "/var/cache/kiln"
                    privileged #true
                    disable-pull #false
                    volumes "/cache" "/root/.m2"
                    volumes "/data"
                    extra-hosts "db.local:10.0.0.5"
                    services "redis" "postgres:16"
                }
            }
        "#;

        let config = parse_runner_config(kdl).unwrap();
        assert_eq!(config.name, "docker-1");
        assert_eq!(config.executor, ExecutorKind::Docker);
        assert_eq!(config.builds_dir, "/builds");
        assert_eq!(config.environment, vec!["CI=true", "LANG=C"]);

        let docker = config.docker().unwrap();
        assert_eq!(docker.image, "ruby:3.3");
        assert_eq!(docker.registry.as_deref(), Some("registry.example.com"));
        assert_eq!(docker.cache_dir.as_deref(), Some("/var/cache/kiln"));
        assert!(docker.privileged);
        assert!(!docker.disable_pull);
        assert!(!docker.disable_cache);
        assert_eq!(docker.volumes, vec!["/cache", "/root/.m2", "/data"]);
        assert_eq!(docker.extra_hosts, vec!["db.local:10.0.0.5"]);
        assert_eq!(docker.services, vec!["redis", "postgres:16"]);
        assert!(config.parallels.is_none());
    }

    #[test]
    fn test_parse_parallels_runner() {
        let kdl = r#"
            runner "mac-1" executor="parallels" {
                parallels {
                    base-name "macos-14"
                    disable-snapshots
                }
                ssh {
                    user "builder"
                    port 2222
                    identity-file "/etc/kiln/id_ed25519"
                }
            }
        "#;

        let config = parse_runner_config(kdl).unwrap();
        assert_eq!(config.executor, ExecutorKind::Parallels);
        assert_eq!(config.builds_dir, DEFAULT_BUILDS_DIR);

        let parallels = config.parallels().unwrap();
        assert_eq!(parallels.base_name, "macos-14");
        assert_eq!(parallels.template_name(), "macos-14-template");
        assert!(parallels.disable_snapshots);

        let ssh = config.ssh().unwrap();
        assert_eq!(ssh.user.as_deref(), Some("builder"));
        assert_eq!(ssh.port, 2222);
        assert_eq!(ssh.identity_file.as_deref(), Some("/etc/kiln/id_ed25519"));
    }

    #[test]
    fn test_ssh_port_defaults_to_22() {
        let kdl = r#"
            runner "mac-1" executor="parallels" {
                ssh {
                    user "builder"
                }
            }
        "#;

        let config = parse_runner_config(kdl).unwrap();
        assert_eq!(config.ssh().unwrap().port, 22);
    }

    #[test]
    fn test_missing_executor() {
        let result = parse_runner_config(r#"runner "r1""#);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "executor"));
    }

    #[test]
    fn test_unknown_executor() {
        let result = parse_runner_config(r#"runner "r1" executor="shell""#);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "executor"
        ));
    }

    #[test]
    fn test_port_out_of_range() {
        let kdl = r#"
            runner "mac-1" executor="parallels" {
                ssh {
                    port 70000
                }
            }
        "#;

        let result = parse_runner_config(kdl);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "ssh.port"
        ));
    }

    #[test]
    fn test_missing_runner_node() {
        let result = parse_runner_config(r#"pipeline "not-a-runner""#);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "runner"));
    }

    #[test]
    fn test_sections_are_optional_when_parsing() {
        let config = parse_runner_config(r#"runner "r1" executor="docker""#).unwrap();
        assert!(config.docker.is_none());
        assert!(config.docker().is_err());
    }

    #[test]
    fn test_load_runner_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.kdl");
        std::fs::write(
            &path,
            r#"
                runner "file-runner" executor="docker" {
                    docker {
                        image "alpine"
                    }
                }
            "#,
        )
        .unwrap();

        let config = load_runner_config(&path).unwrap();
        assert_eq!(config.name, "file-runner");
        assert_eq!(config.docker().unwrap().image, "alpine");
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_runner_config(dir.path().join("absent.kdl"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
