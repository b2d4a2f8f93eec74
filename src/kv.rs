//! The key/value collaborator.
//!
//! A `Backend` is owned by one dedicated thread. Everything else talks to it
//! through a [`KvHandle`], which ships closures over a channel and waits for
//! the reply, either from async code or from a plain blocking thread.

use std::collections::{HashMap, VecDeque};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::KvError;

/// The Redis-style subset the emulator service needs.
pub trait Backend: Send {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
    /// Returns whether the key existed.
    fn del(&mut self, key: &str) -> Result<bool, KvError>;
    /// Inclusive byte range; negative indices count from the end. Absent keys are empty.
    fn getrange(&mut self, key: &str, start: i64, end: i64) -> Result<Vec<u8>, KvError>;
    /// Returns the new list length.
    fn lpush(&mut self, key: &str, value: Vec<u8>) -> Result<usize, KvError>;
    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> Result<(), KvError>;
    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError>;
}

enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

/// Turn a Redis-style inclusive `start..=end` into a half-open range, if non-empty.
fn normalize(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize + 1))
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    values: HashMap<String, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn bytes(&self, key: &str) -> Result<Option<&Vec<u8>>, KvError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::Bytes(bytes)) => Ok(Some(bytes)),
            Some(Value::List(_)) => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn list(&self, key: &str) -> Result<Option<&VecDeque<Vec<u8>>>, KvError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(Value::Bytes(_)) => Err(KvError::WrongType(key.to_string())),
        }
    }
}

impl Backend for MemoryBackend {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.bytes(key)?.cloned())
    }

    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.values.insert(key.to_string(), Value::Bytes(value));
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<bool, KvError> {
        Ok(self.values.remove(key).is_some())
    }

    fn getrange(&mut self, key: &str, start: i64, end: i64) -> Result<Vec<u8>, KvError> {
        let bytes = match self.bytes(key)? {
            Some(bytes) => bytes,
            None => return Ok(Vec::new()),
        };
        Ok(match normalize(bytes.len(), start, end) {
            Some((from, to)) => bytes[from..to].to_vec(),
            None => Vec::new(),
        })
    }

    fn lpush(&mut self, key: &str, value: Vec<u8>) -> Result<usize, KvError> {
        self.list(key)?;
        let entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.push_front(value);
                Ok(list.len())
            }
            Value::Bytes(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> Result<(), KvError> {
        let len = match self.list(key)? {
            Some(list) => list.len(),
            None => return Ok(()),
        };
        match normalize(len, start, stop) {
            Some((from, to)) => {
                if let Some(Value::List(list)) = self.values.get_mut(key) {
                    list.truncate(to);
                    list.drain(..from);
                }
            }
            None => {
                self.values.remove(key);
            }
        }
        Ok(())
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError> {
        let list = match self.list(key)? {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        Ok(match normalize(list.len(), start, stop) {
            Some((from, to)) => list.range(from..to).cloned().collect(),
            None => Vec::new(),
        })
    }
}

type Job = Box<dyn FnOnce(&mut dyn Backend) + Send>;

/// Cloneable handle to the key/value actor.
#[derive(Clone)]
pub struct KvHandle {
    sender: mpsc::UnboundedSender<Job>,
}

impl KvHandle {
    /// Start the actor thread. It exits once every handle has been dropped.
    pub fn spawn(backend: impl Backend + 'static) -> std::io::Result<KvHandle> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let mut backend: Box<dyn Backend> = Box::new(backend);

        thread::Builder::new().name("kv".to_string()).spawn(move || {
            info!("key/value actor started");
            while let Some(job) = receiver.blocking_recv() {
                job(backend.as_mut());
            }
            debug!("key/value actor stopped");
        })?;

        Ok(KvHandle { sender })
    }

    fn submit<R, F>(&self, job: F) -> Result<oneshot::Receiver<Result<R, KvError>>, KvError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Backend) -> Result<R, KvError> + Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(Box::new(move |backend: &mut dyn Backend| {
                let _ = reply.send(job(backend));
            }))
            .map_err(|_| KvError::Unavailable)?;
        Ok(receiver)
    }

    /// Run `job` on the actor and wait for its result.
    pub async fn call<R, F>(&self, job: F) -> Result<R, KvError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Backend) -> Result<R, KvError> + Send + 'static,
    {
        self.submit(job)?.await.map_err(|_| KvError::Unavailable)?
    }

    /// Like [`KvHandle::call`], for threads outside the async runtime. Panics if
    /// called from inside one.
    pub fn blocking_call<R, F>(&self, job: F) -> Result<R, KvError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn Backend) -> Result<R, KvError> + Send + 'static,
    {
        self.submit(job)?.blocking_recv().map_err(|_| KvError::Unavailable)?
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let key = key.to_string();
        self.call(move |kv| kv.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let key = key.to_string();
        self.call(move |kv| kv.set(&key, value)).await
    }

    pub async fn del(&self, key: &str) -> Result<bool, KvError> {
        let key = key.to_string();
        self.call(move |kv| kv.del(&key)).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, KvError> {
        let key = key.to_string();
        self.call(move |kv| kv.lrange(&key, start, stop)).await
    }

    pub fn blocking_get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let key = key.to_string();
        self.blocking_call(move |kv| kv.get(&key))
    }

    pub fn blocking_set(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let key = key.to_string();
        self.blocking_call(move |kv| kv.set(&key, value))
    }

    pub fn blocking_del(&self, key: &str) -> Result<bool, KvError> {
        let key = key.to_string();
        self.blocking_call(move |kv| kv.del(&key))
    }

    pub fn blocking_getrange(&self, key: &str, start: i64, end: i64) -> Result<Vec<u8>, KvError> {
        let key = key.to_string();
        self.blocking_call(move |kv| kv.getrange(&key, start, end))
    }

    /// `LPUSH` then `LTRIM 0 keep` in one round-trip.
    pub fn blocking_push_bounded(&self, key: &str, value: Vec<u8>, keep: i64) -> Result<(), KvError> {
        let key = key.to_string();
        self.blocking_call(move |kv| {
            kv.lpush(&key, value)?;
            kv.ltrim(&key, 0, keep)
        })
    }
}
