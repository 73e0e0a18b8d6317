//! Auxiliary service containers.

use kiln_core::{Error, Result};

/// A parsed `name[:version]` service entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub version: String,
}

impl ServiceSpec {
    pub fn parse(description: &str) -> Result<Self> {
        let (name, version) = split_service_and_version(description)?;
        Ok(Self { name, version })
    }

    pub fn image(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    /// DNS-safe alias the build container reaches the service under.
    pub fn alias(&self) -> String {
        self.name.replace('/', "__")
    }

    /// Container name, unique per project.
    pub fn container_name(&self, project_unique_name: &str) -> String {
        format!("{}-{}", project_unique_name, self.alias())
    }

    /// Docker link entry `<container>:<alias>`.
    pub fn link(&self, project_unique_name: &str) -> String {
        format!("{}:{}", self.container_name(project_unique_name), self.alias())
    }
}

/// Split `redis:3.2` into `("redis", "3.2")`; the version defaults to `latest`.
pub fn split_service_and_version(description: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = description.split(':').collect();
    let (name, version) = match parts.as_slice() {
        [name] => (*name, "latest"),
        [name, version] => (*name, *version),
        _ => {
            return Err(Error::Config(format!(
                "invalid service '{}': expected name or name:version",
                description
            )));
        }
    };

    if name.is_empty() {
        return Err(Error::Config(format!(
            "invalid service '{}': empty name",
            description
        )));
    }
    if version.is_empty() {
        return Err(Error::Config(format!(
            "invalid service '{}': empty version",
            description
        )));
    }

    Ok((name.to_string(), version.to_string()))
}
