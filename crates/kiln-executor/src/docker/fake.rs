//! In-memory daemon for executor tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use kiln_core::handle::{ContainerHandle, ImageHandle};
use kiln_core::log::LogStream;
use kiln_core::{Error, Result};
use tokio::io::{AsyncReadExt, DuplexStream};

use super::api::{ContainerApi, ContainerIo, ContainerSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    InspectImage(String),
    Pull(String),
    Create(String),
    Attach(String),
    Start(String),
    Wait(String),
    Remove(String),
}

#[derive(Default)]
struct State {
    unreachable: bool,
    images: HashMap<String, ImageHandle>,
    pullable: HashSet<String>,
    /// id -> name
    containers: HashMap<String, String>,
    created: HashMap<String, ContainerSpec>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    fail_remove: HashSet<String>,
    output: Vec<(LogStream, Bytes)>,
    exit_code: i64,
    /// Build output never ends and the container never exits.
    hang: bool,
    stdin: Option<DuplexStream>,
    next_id: u32,
    calls: Vec<Call>,
}

#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<State>,
}

impl FakeDocker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_image(&self, name: &str, volumes: &[&str]) {
        self.with(|s| {
            s.images.insert(
                name.to_string(),
                ImageHandle {
                    id: format!("sha256:{}", name),
                    volumes: volumes.iter().map(|v| v.to_string()).collect(),
                },
            );
        });
    }

    pub fn allow_pull(&self, name: &str) {
        self.with(|s| s.pullable.insert(name.to_string()));
    }

    pub fn set_unreachable(&self) {
        self.with(|s| s.unreachable = true);
    }

    /// A leftover container from an earlier run.
    pub fn add_container(&self, name: &str) {
        self.with(|s| {
            s.containers
                .insert(format!("stale-{}", name), name.to_string())
        });
    }

    pub fn fail_create(&self, name: &str) {
        self.with(|s| s.fail_create.insert(name.to_string()));
    }

    pub fn fail_start(&self, name: &str) {
        self.with(|s| s.fail_start.insert(name.to_string()));
    }

    pub fn fail_remove(&self, id: &str) {
        self.with(|s| s.fail_remove.insert(id.to_string()));
    }

    pub fn set_output(&self, chunks: Vec<(LogStream, &str)>) {
        self.with(|s| {
            s.output = chunks
                .into_iter()
                .map(|(stream, text)| (stream, Bytes::from(text.to_string())))
                .collect()
        });
    }

    pub fn hang(&self) {
        self.with(|s| s.hang = true);
    }

    pub fn set_exit_code(&self, code: i64) {
        self.with(|s| s.exit_code = code);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    pub fn created(&self, name: &str) -> Option<ContainerSpec> {
        self.with(|s| s.created.get(name).cloned())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.with(|s| s.containers.values().any(|n| n == name))
    }

    /// Number of containers currently present.
    pub fn running(&self) -> usize {
        self.with(|s| s.containers.len())
    }

    /// Everything written to the build container's stdin.
    pub async fn stdin(&self) -> Vec<u8> {
        let reader = self.with(|s| s.stdin.take());
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            reader.read_to_end(&mut buf).await.unwrap();
        }
        buf
    }
}

#[async_trait]
impl ContainerApi for FakeDocker {
    async fn ping(&self) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Ping);
            if s.unreachable {
                Err(Error::Connection("connection refused".to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn inspect_image(&self, name: &str) -> Result<Option<ImageHandle>> {
        self.with(|s| {
            s.calls.push(Call::InspectImage(name.to_string()));
            Ok(s.images.get(name).cloned())
        })
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Pull(name.to_string()));
            if !s.pullable.contains(name) {
                return Err(Error::PullFailure {
                    image: name.to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
            s.images.insert(
                name.to_string(),
                ImageHandle {
                    id: format!("sha256:{}", name),
                    volumes: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.with(|s| {
            s.calls.push(Call::Create(spec.name.clone()));
            if s.fail_create.contains(&spec.name) {
                return Err(Error::ContainerCreate {
                    name: spec.name.clone(),
                    message: "no space left on device".to_string(),
                });
            }
            if s.containers.values().any(|n| *n == spec.name) {
                return Err(Error::ContainerCreate {
                    name: spec.name.clone(),
                    message: "Conflict. The container name is already in use".to_string(),
                });
            }

            s.next_id += 1;
            let id = format!("c{:04}", s.next_id);
            s.containers.insert(id.clone(), spec.name.clone());
            s.created.insert(spec.name.clone(), spec.clone());
            Ok(ContainerHandle {
                id,
                name: spec.name.clone(),
            })
        })
    }

    async fn attach_container(&self, id: &str) -> Result<ContainerIo> {
        let (input, reader) = tokio::io::duplex(64 * 1024);
        let (output, hang) = self.with(|s| {
            s.calls.push(Call::Attach(id.to_string()));
            s.stdin = Some(reader);
            (s.output.clone(), s.hang)
        });

        let output = futures::stream::iter(output.into_iter().map(Ok));
        let output = if hang {
            output.chain(futures::stream::pending()).boxed()
        } else {
            output.boxed()
        };

        Ok(ContainerIo {
            output,
            input: Box::pin(input),
        })
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(Call::Start(id.to_string()));
            let name = s.containers.get(id).cloned().unwrap_or_default();
            if s.fail_start.contains(&name) {
                return Err(Error::ContainerStart {
                    name,
                    message: "OCI runtime create failed".to_string(),
                });
            }
            Ok(())
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let (hang, exit_code) = self.with(|s| {
            s.calls.push(Call::Wait(id.to_string()));
            (s.hang, s.exit_code)
        });
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(exit_code)
    }

    async fn remove_container(&self, target: &str) -> Result<bool> {
        self.with(|s| {
            s.calls.push(Call::Remove(target.to_string()));
            if s.fail_remove.contains(target) {
                return Err(Error::Internal(format!("cannot remove {}", target)));
            }
            let id = s
                .containers
                .iter()
                .find(|(id, name)| *id == target || *name == target)
                .map(|(id, _)| id.clone());
            match id {
                Some(id) => {
                    s.containers.remove(&id);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }
}
