use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::connection::Connection;
use crate::frame::Frame;
use crate::queue::ReplyHandle;
use crate::Error;

/// A wire command: a name and its ordered argument list. Commands carry no
/// semantics of their own; they serialize into an array of bulk strings and
/// go through the engine's submit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }
}

/// Thin typed wrappers over the engine. Each builder serializes arguments,
/// submits, and converts the reply; ordering, pipelining, timeouts and error
/// routing all live in the engine.
impl Connection {
    /// Submits an arbitrary command against a logical database and returns
    /// the completion handle.
    pub fn raw(&self, db: Option<i64>, command: Command) -> Result<ReplyHandle, Error> {
        let db = db.map(database_index).transpose()?;
        self.submit(db, command)
    }

    /// Round-trips a PING and records the measured latency.
    pub async fn ping(&self) -> Result<Duration, Error> {
        let started = Instant::now();
        self.submit(None, Command::new("PING"))?.wait().await?;
        let elapsed = started.elapsed();
        self.queue.record_ping(elapsed.as_millis() as u64);
        Ok(elapsed)
    }

    pub async fn echo(&self, payload: impl AsRef<[u8]>) -> Result<Bytes, Error> {
        let reply = self
            .submit(None, Command::new("ECHO").arg(payload))?
            .wait()
            .await?;
        match reply {
            Frame::Bulk(bytes) => Ok(bytes),
            other => Err(unexpected("ECHO", &other)),
        }
    }

    /// Get the value of `key` in database `db`; `None` when the key does not
    /// exist.
    pub async fn get(&self, db: i64, key: &str) -> Result<Option<Bytes>, Error> {
        let db = Some(database_index(db)?);
        let reply = self
            .submit(db, Command::new("GET").arg(key))?
            .wait()
            .await?;
        match reply {
            Frame::Bulk(bytes) => Ok(Some(bytes)),
            Frame::Null => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    pub async fn set(&self, db: i64, key: &str, value: impl AsRef<[u8]>) -> Result<(), Error> {
        let db = Some(database_index(db)?);
        let reply = self
            .submit(db, Command::new("SET").arg(key).arg(value))?
            .wait()
            .await?;
        expect_ok("SET", &reply)
    }

    /// Deletes `keys`; returns how many existed.
    pub async fn del(&self, db: i64, keys: &[&str]) -> Result<i64, Error> {
        let db = Some(database_index(db)?);
        let mut command = Command::new("DEL");
        for key in keys {
            command = command.arg(key);
        }
        let reply = self.submit(db, command)?.wait().await?;
        as_integer("DEL", &reply)
    }

    pub async fn exists(&self, db: i64, key: &str) -> Result<bool, Error> {
        let db = Some(database_index(db)?);
        let reply = self
            .submit(db, Command::new("EXISTS").arg(key))?
            .wait()
            .await?;
        Ok(as_integer("EXISTS", &reply)? != 0)
    }

    /// Publishes `payload` on `channel`; returns the number of subscribers
    /// that received it.
    pub async fn publish(&self, channel: &str, payload: impl AsRef<[u8]>) -> Result<i64, Error> {
        let reply = self
            .submit(None, Command::new("PUBLISH").arg(channel).arg(payload))?
            .wait()
            .await?;
        as_integer("PUBLISH", &reply)
    }

    pub async fn server_info(&self) -> Result<String, Error> {
        let reply = self.submit(None, Command::new("INFO"))?.wait().await?;
        match reply {
            Frame::Bulk(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            other => Err(unexpected("INFO", &other)),
        }
    }
}

fn database_index(db: i64) -> Result<u32, Error> {
    u32::try_from(db)
        .map_err(|_| Error::InvalidArgument(format!("database index {db} is out of range")))
}

fn expect_ok(command: &str, frame: &Frame) -> Result<(), Error> {
    match frame {
        Frame::Simple(_) => Ok(()),
        other => Err(unexpected(command, other)),
    }
}

fn as_integer(command: &str, frame: &Frame) -> Result<i64, Error> {
    match frame {
        Frame::Integer(value) => Ok(*value),
        other => Err(unexpected(command, other)),
    }
}

fn unexpected(command: &str, frame: &Frame) -> Error {
    Error::Protocol(format!("unexpected {command} reply: {frame}"))
}
