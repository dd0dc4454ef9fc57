use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::commands::Command;
use crate::connection::ConnectionState;
use crate::counters::{Counters, CountersSnapshot};
use crate::frame::Frame;
use crate::Error;

/// Everything the engine needs to know about one submitted request.
pub(crate) struct Submission {
    pub command: Command,
    /// Logical database the command targets; `None` for database-agnostic
    /// commands (PING, INFO, pub/sub).
    pub db: Option<u32>,
    pub deadline: Option<Instant>,
    /// Admit ahead of already-queued, unsent normal requests.
    pub high_priority: bool,
    /// Part of the open handshake; admissible while the connection is still
    /// Opening.
    pub handshake: bool,
}

struct Entry {
    id: u64,
    command: Command,
    db: Option<u32>,
    completion: Option<oneshot::Sender<Result<Frame, Error>>>,
    created_at: Instant,
    deadline: Option<Instant>,
    /// Set once the entry's outcome has been decided (reply, error, timeout,
    /// cancellation). A discharged entry may still sit in the sent lane
    /// waiting to absorb its reply, which is then discarded.
    discharged: bool,
}

impl Entry {
    fn discharge(&mut self, result: Result<Frame, Error>) {
        self.discharged = true;
        if let Some(completion) = self.completion.take() {
            // The caller may have dropped the handle; the outcome is still
            // accounted for either way.
            let _ = completion.send(result);
        }
    }
}

/// What the writer loop should do next.
pub(crate) enum Batch {
    /// Serialize and transmit these commands as one pipelined write.
    Write(Vec<Command>),
    /// Nothing ready; park until the queue turns non-empty.
    Idle,
    /// The connection reached a state where no more writes will ever happen.
    Shutdown,
}

struct Inner {
    state: ConnectionState,
    /// Unsent queue jumpers, FIFO among themselves.
    priority: VecDeque<Entry>,
    /// Unsent normal requests, FIFO.
    normal: VecDeque<Entry>,
    /// Transmitted requests in exact transmission order, awaiting replies.
    sent: VecDeque<Entry>,
    deadlines: BTreeSet<(Instant, u64)>,
    counters: Counters,
    next_id: u64,
    /// Database the server connection will be in once everything queued so
    /// far has executed; a change interleaves a SELECT.
    pending_db: u32,
}

impl Inner {
    fn unsent_len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    fn is_drained(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty() && self.sent.is_empty()
    }

    fn unregister_deadline(&mut self, deadline: Option<Instant>, id: u64) {
        if let Some(deadline) = deadline {
            self.deadlines.remove(&(deadline, id));
        }
    }
}

/// The ordered collection of not-yet-completed requests, plus the connection
/// state that gates admission. The single mutex makes enqueue, queue-jump,
/// head-completion, deadline discharge and cancel-drain mutually exclusive;
/// transport I/O always happens outside it.
pub(crate) struct RequestQueue {
    inner: Mutex<Inner>,
    /// Wakes the writer loop when work becomes available.
    pub(crate) writer: Notify,
    /// Wakes the deadline sweeper when an earlier deadline is registered.
    pub(crate) sweeper: Notify,
    /// Signalled whenever the queue fully drains; close() waits on it.
    pub(crate) drained: Notify,
    /// Signalled once when the connection reaches a terminal state.
    pub(crate) shutdown: Notify,
}

impl RequestQueue {
    pub fn new(initial_db: u32) -> Arc<RequestQueue> {
        Arc::new(RequestQueue {
            inner: Mutex::new(Inner {
                state: ConnectionState::Closed,
                priority: VecDeque::new(),
                normal: VecDeque::new(),
                sent: VecDeque::new(),
                deadlines: BTreeSet::new(),
                counters: Counters::default(),
                next_id: 0,
                pending_db: initial_db,
            }),
            writer: Notify::new(),
            sweeper: Notify::new(),
            drained: Notify::new(),
            shutdown: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("request queue lock poisoned")
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn transition(&self, to: ConnectionState) {
        let mut inner = self.lock();
        debug!(from = %inner.state, %to, "connection state transition");
        inner.state = to;
    }

    pub fn set_pending_db(&self, db: u32) {
        self.lock().pending_db = db;
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let inner = self.lock();
        inner.counters.snapshot(inner.unsent_len(), inner.sent.len())
    }

    pub fn record_ping(&self, millis: u64) {
        self.lock().counters.last_ping_ms = Some(millis);
    }

    /// Admits a request, interleaving a SELECT when it targets a different
    /// database than the one the connection will be in.
    pub fn submit(self: &Arc<Self>, submission: Submission) -> Result<ReplyHandle, Error> {
        let mut inner = self.lock();

        match inner.state {
            ConnectionState::Open => {}
            ConnectionState::Opening if submission.handshake => {}
            state => return Err(Error::SubmissionRejected(state)),
        }

        if let Some(db) = submission.db {
            if db != inner.pending_db {
                let select = Command::new("SELECT").arg(db.to_string());
                push_entry(
                    &mut inner,
                    select,
                    Some(db),
                    None,
                    submission.deadline,
                    submission.high_priority,
                );
                inner.pending_db = db;
            }
        }

        // A jumper is only recorded as such when it actually overtakes
        // queued work.
        if submission.high_priority && !inner.normal.is_empty() {
            inner.counters.queue_jumpers += 1;
        }

        let (completion, receiver) = oneshot::channel();
        let id = push_entry(
            &mut inner,
            submission.command,
            submission.db,
            Some(completion),
            submission.deadline,
            submission.high_priority,
        );

        let earliest = inner.deadlines.iter().next().map(|(at, _)| *at);
        let expires_next = submission.deadline.is_some() && earliest == submission.deadline;
        drop(inner);

        self.writer.notify_one();
        if expires_next {
            // The new deadline is the next one due; reschedule the sweeper.
            self.sweeper.notify_one();
        }

        Ok(ReplyHandle {
            id,
            receiver,
            queue: Arc::clone(self),
        })
    }

    /// Moves every ready request to the sent lane (priority lane first) and
    /// hands their commands to the writer. Entries enter `sent` before the
    /// transport write so a fast reply can never observe an untracked
    /// request; the sent counter is only bumped by `mark_sent` once the
    /// write has succeeded.
    pub fn take_batch(&self) -> Batch {
        let mut inner = self.lock();

        match inner.state {
            ConnectionState::Closed | ConnectionState::Faulted => return Batch::Shutdown,
            _ => {}
        }

        let mut commands = Vec::with_capacity(inner.unsent_len());
        while let Some(entry) = inner.priority.pop_front() {
            commands.push(entry.command.clone());
            inner.sent.push_back(entry);
        }
        while let Some(entry) = inner.normal.pop_front() {
            commands.push(entry.command.clone());
            inner.sent.push_back(entry);
        }

        if commands.is_empty() {
            if inner.state == ConnectionState::Closing {
                // Nothing queued and nothing will be admitted again.
                return Batch::Shutdown;
            }
            return Batch::Idle;
        }

        Batch::Write(commands)
    }

    pub fn mark_sent(&self, count: u64) {
        self.lock().counters.sent += count;
    }

    /// Completes the oldest outstanding request with `reply`. A reply with
    /// nothing outstanding means the stream is desynchronized, which is fatal.
    pub fn complete_head(&self, reply: Frame) -> Result<(), Error> {
        let mut inner = self.lock();

        let mut entry = match inner.sent.pop_front() {
            Some(entry) => entry,
            None => {
                return Err(Error::Protocol(
                    "reply received with no outstanding request".to_string(),
                ))
            }
        };
        inner.unregister_deadline(entry.deadline, entry.id);

        if entry.discharged {
            // The caller already saw a timeout or cancellation; the reply is
            // consumed to keep the stream aligned and then dropped.
            debug!(id = entry.id, db = ?entry.db, "discarding reply for discharged request");
        } else {
            match reply {
                Frame::Error(message) => {
                    inner.counters.errors += 1;
                    entry.discharge(Err(Error::Server(message)));
                }
                frame => {
                    inner.counters.received += 1;
                    entry.discharge(Ok(frame));
                }
            }
        }

        if inner.is_drained() {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Caller-initiated cancellation. Unsent requests are removed without
    /// transmission; sent requests are failed locally and stay queued so the
    /// eventual reply is absorbed in order.
    pub fn cancel(&self, id: u64) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let unsent = match inner.priority.iter().position(|entry| entry.id == id) {
            Some(index) => inner.priority.remove(index),
            None => inner
                .normal
                .iter()
                .position(|entry| entry.id == id)
                .and_then(|index| inner.normal.remove(index)),
        };

        if let Some(mut entry) = unsent {
            entry.discharge(Err(Error::Cancelled("cancelled by caller".to_string())));
            inner.counters.cancelled += 1;
            inner.unregister_deadline(entry.deadline, entry.id);
            if inner.is_drained() {
                self.drained.notify_waiters();
            }
            return;
        }

        if let Some(entry) = inner.sent.iter_mut().find(|entry| entry.id == id) {
            if !entry.discharged {
                entry.discharge(Err(Error::Cancelled("cancelled by caller".to_string())));
                inner.counters.cancelled += 1;
            }
        }
    }

    /// Fails every deadline that has passed. Sent requests stay queued so
    /// ordering is preserved; unsent ones never reach the transport. Returns
    /// the next pending deadline, if any.
    pub fn expire_due(&self, now: Instant) -> Option<Instant> {
        let mut inner = self.lock();

        let due: Vec<(Instant, u64)> = inner
            .deadlines
            .iter()
            .take_while(|(at, _)| at <= &now)
            .cloned()
            .collect();

        for (at, id) in due {
            inner.deadlines.remove(&(at, id));
            expire_entry(&mut inner, id);
        }

        if inner.is_drained() {
            self.drained.notify_waiters();
        }
        inner.deadlines.iter().next().map(|(at, _)| *at)
    }

    /// Moves the connection to Faulted and drains every pending handle with
    /// the fault, each exactly once. Idempotent once terminal.
    pub fn fault(&self, error: Error) {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Closed | ConnectionState::Faulted => return,
            _ => {}
        }
        tracing::error!(%error, "connection fault");
        inner.state = ConnectionState::Faulted;
        cancel_all(&mut inner, error);
        drop(inner);
        self.wake_all();
    }

    /// Starts a graceful close. Returns false when the connection is already
    /// terminal and there is nothing to do.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Open | ConnectionState::Opening => {
                inner.state = ConnectionState::Closing;
                drop(inner);
                self.writer.notify_one();
                true
            }
            ConnectionState::Closing => true,
            ConnectionState::Closed | ConnectionState::Faulted => false,
        }
    }

    /// Finishes a graceful close: anything still pending after the drain
    /// grace period is cancelled with the graceful reason.
    pub fn finish_close(&self) {
        let mut inner = self.lock();
        if inner.state == ConnectionState::Closing {
            cancel_all(&mut inner, Error::Cancelled("connection closed".to_string()));
            inner.state = ConnectionState::Closed;
        }
        drop(inner);
        self.wake_all();
    }

    /// Teardown for a connection dropped without close(); everything pending
    /// is cancelled and the loops are told to stop.
    pub fn abandon(&self) {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Closed | ConnectionState::Faulted => return,
            _ => {}
        }
        cancel_all(&mut inner, Error::Cancelled("connection dropped".to_string()));
        inner.state = ConnectionState::Closed;
        drop(inner);
        self.wake_all();
    }

    pub fn is_drained(&self) -> bool {
        self.lock().is_drained()
    }

    fn wake_all(&self) {
        self.writer.notify_one();
        self.sweeper.notify_one();
        self.drained.notify_waiters();
        self.shutdown.notify_waiters();
    }
}

fn push_entry(
    inner: &mut Inner,
    command: Command,
    db: Option<u32>,
    completion: Option<oneshot::Sender<Result<Frame, Error>>>,
    deadline: Option<Instant>,
    high_priority: bool,
) -> u64 {
    let id = inner.next_id;
    inner.next_id += 1;

    if let Some(deadline) = deadline {
        inner.deadlines.insert((deadline, id));
    }

    let entry = Entry {
        id,
        command,
        db,
        completion,
        created_at: Instant::now(),
        deadline,
        discharged: false,
    };
    if high_priority {
        inner.priority.push_back(entry);
    } else {
        inner.normal.push_back(entry);
    }
    id
}

fn expire_entry(inner: &mut Inner, id: u64) {
    for lane in [&mut inner.priority, &mut inner.normal] {
        if let Some(index) = lane.iter().position(|entry| entry.id == id) {
            let mut entry = lane.remove(index).expect("index just found");
            debug!(
                id,
                db = ?entry.db,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "request timed out before transmission"
            );
            entry.discharge(Err(Error::Timeout));
            inner.counters.timeouts += 1;
            return;
        }
    }

    if let Some(entry) = inner.sent.iter_mut().find(|entry| entry.id == id) {
        if !entry.discharged {
            debug!(
                id,
                db = ?entry.db,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "request timed out awaiting reply"
            );
            entry.discharge(Err(Error::Timeout));
            inner.counters.timeouts += 1;
        }
    }
}

fn cancel_all(inner: &mut Inner, error: Error) {
    let mut lanes: Vec<Entry> = Vec::new();
    lanes.extend(inner.priority.drain(..));
    lanes.extend(inner.normal.drain(..));
    lanes.extend(inner.sent.drain(..));
    inner.deadlines.clear();

    for mut entry in lanes {
        if !entry.discharged {
            entry.discharge(Err(error.clone()));
            inner.counters.cancelled += 1;
        }
    }
}

/// The caller's side of a submitted request. The reply (or failure) arrives
/// asynchronously; dropping the handle abandons the reply without affecting
/// protocol order.
pub struct ReplyHandle {
    id: u64,
    receiver: oneshot::Receiver<Result<Frame, Error>>,
    queue: Arc<RequestQueue>,
}

impl ReplyHandle {
    /// Waits for the request's outcome.
    pub async fn wait(self) -> Result<Frame, Error> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled("connection dropped".to_string())),
        }
    }

    /// Cancels the request: removed outright when still unsent, failed
    /// locally (with its eventual reply discarded) when already on the wire.
    pub fn cancel(&self) {
        self.queue.cancel(self.id);
    }
}
