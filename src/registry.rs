use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::InstanceConfig;
use crate::error::ControlError;
use crate::instance::CpuHandle;
use crate::kv::KvHandle;
use crate::metrics::set_active_instances;

enum Command {
    Lookup {
        name: String,
        reply: oneshot::Sender<Result<CpuHandle, ControlError>>,
    },
    List {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Maps instance names to running instances, creating them on first lookup.
/// Instances live for the rest of the process.
#[derive(Clone)]
pub struct Registry {
    sender: mpsc::UnboundedSender<Command>,
}

impl Registry {
    /// Start the registry task. Must be called inside a tokio runtime.
    pub fn spawn(kv: KvHandle, config: InstanceConfig) -> Registry {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut cpus: BTreeMap<String, CpuHandle> = BTreeMap::new();
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Lookup { name, reply } => {
                        let result = match cpus.get(&name) {
                            Some(handle) => Ok(handle.clone()),
                            None => CpuHandle::spawn(&name, kv.clone(), config.clone()).map(|handle| {
                                info!(cpu = %name, "created cpu instance");
                                cpus.insert(name.clone(), handle.clone());
                                set_active_instances(cpus.len());
                                handle
                            }),
                        };
                        let _ = reply.send(result);
                    }
                    Command::List { reply } => {
                        let _ = reply.send(cpus.keys().cloned().collect());
                    }
                }
            }
            debug!("registry stopped");
        });

        Registry { sender }
    }

    fn gone() -> ControlError {
        ControlError::Gone("registry".to_string())
    }

    /// The instance called `name`, created if this is the first lookup.
    pub async fn get(&self, name: &str) -> Result<CpuHandle, ControlError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Command::Lookup {
                name: name.to_string(),
                reply,
            })
            .map_err(|_| Self::gone())?;
        receiver.await.map_err(|_| Self::gone())?
    }

    pub async fn names(&self) -> Result<Vec<String>, ControlError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Command::List { reply })
            .map_err(|_| Self::gone())?;
        receiver.await.map_err(|_| Self::gone())
    }
}
