//! The simulated RPC fabric: named endpoints, per-endpoint enable bits,
//! reliability/reordering/delay injection, and a single request queue
//! drained by one dispatcher thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

use crate::host::ServerHost;
use crate::service::MethodOutcome;

/// Liveness is polled at this granularity while a dispatch worker awaits
/// a host's reply, and bounds how long `cleanup()` takes to be observed.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

const UNRELIABLE_DROP_PER_MILLE: u32 = 100;
const UNRELIABLE_JITTER_MS: u64 = 27;
const LONG_REORDER_PER_900: u32 = 600;
const LONG_REORDER_BASE_MS: u64 = 200;
const LONG_REORDER_SPREAD_MS: u64 = 2000;
const DISABLED_DELAY_MS: u64 = 100;
const DISABLED_LONG_DELAY_MS: u64 = 7000;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A transport-level outcome. There is no richer error channel than this:
/// every failure mode (drop, disabled endpoint, dead host, full queue)
/// collapses to the same retryable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    Timeout,
}

struct Request {
    endname: String,
    svc_method: String,
    args: Vec<u8>,
    reply_tx: mpsc::Sender<ReplyMsg>,
}

#[derive(Clone)]
enum ReplyMsg {
    Ok(Vec<u8>),
    Fail,
}

struct EndpointState {
    server_id: Option<u64>,
    enabled: bool,
}

#[derive(Default)]
struct NetworkState {
    ends: HashMap<String, EndpointState>,
    servers: HashMap<u64, Arc<ServerHost>>,
    reliable: bool,
    long_reordering: bool,
    long_delays: bool,
    count: u64,
    bytes: u64,
}

/// A named logical handle into the `Network`, connected to one server id.
#[derive(Clone)]
pub struct ClientEnd {
    endname: String,
    network: Network,
}

impl ClientEnd {
    pub fn call(&self, svc_method: &str, args: Vec<u8>) -> Result<Vec<u8>, CallError> {
        self.network.call(&self.endname, svc_method, args)
    }
}

/// The simulated network fabric. Cheap to clone, since all state lives
/// behind `Arc`s, so a clone is a new handle onto the same fabric, not a
/// copy of it.
#[derive(Clone)]
pub struct Network {
    state: Arc<Mutex<NetworkState>>,
    sender: SyncSender<Request>,
    done: Arc<AtomicBool>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::sync_channel(DEFAULT_QUEUE_CAPACITY);
        let state = Arc::new(Mutex::new(NetworkState {
            reliable: true,
            ..Default::default()
        }));
        let done = Arc::new(AtomicBool::new(false));

        let net = Network {
            state,
            sender,
            done,
        };
        net.spawn_dispatcher(receiver);
        net
    }

    fn spawn_dispatcher(&self, receiver: Receiver<Request>) {
        let net = self.clone();
        thread::spawn(move || loop {
            match receiver.recv_timeout(LIVENESS_POLL) {
                Ok(req) => {
                    {
                        let mut state = net.state.lock().unwrap();
                        state.count += 1;
                        state.bytes += req.args.len() as u64;
                    }
                    let worker = net.clone();
                    thread::spawn(move || worker.process_req(req));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if net.done.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });
    }

    /// Registers a new endpoint. Initial state is disabled, unconnected.
    ///
    /// Panics if `endname` is already registered: a duplicate name is a
    /// configuration error in the caller, not a runtime fault.
    pub fn make_end(&self, endname: impl Into<String>) -> ClientEnd {
        let endname = endname.into();
        let mut state = self.state.lock().unwrap();
        if state.ends.contains_key(&endname) {
            panic!("Network::make_end: {endname:?} already exists");
        }
        state.ends.insert(
            endname.clone(),
            EndpointState {
                server_id: None,
                enabled: false,
            },
        );
        ClientEnd {
            endname,
            network: self.clone(),
        }
    }

    pub fn connect(&self, endname: &str, server_id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(end) = state.ends.get_mut(endname) {
            end.server_id = Some(server_id);
        }
    }

    pub fn enable(&self, endname: &str, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(end) = state.ends.get_mut(endname) {
            end.enabled = enabled;
        }
    }

    /// Registers or replaces the host behind `server_id`. Replacing a host
    /// under a live endname is how a server restart is modeled: any RPC
    /// in flight to the old host observes it as dead.
    pub fn add_server(&self, server_id: u64, host: Arc<ServerHost>) {
        let mut state = self.state.lock().unwrap();
        state.servers.insert(server_id, host);
    }

    pub fn reliable(&self, yes: bool) {
        self.state.lock().unwrap().reliable = yes;
    }

    pub fn long_reordering(&self, yes: bool) {
        self.state.lock().unwrap().long_reordering = yes;
    }

    pub fn long_delays(&self, yes: bool) {
        self.state.lock().unwrap().long_delays = yes;
    }

    pub fn is_server_enabled(&self, server_id: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .ends
            .values()
            .any(|end| end.server_id == Some(server_id) && end.enabled)
    }

    pub fn total_request_count(&self) -> u64 {
        self.state.lock().unwrap().count
    }

    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().bytes
    }

    /// Signals shutdown. The dispatcher thread and any polling dispatch
    /// workers observe this within one `LIVENESS_POLL` interval.
    pub fn cleanup(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    fn call(&self, endname: &str, svc_method: &str, args: Vec<u8>) -> Result<Vec<u8>, CallError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let req = Request {
            endname: endname.to_string(),
            svc_method: svc_method.to_string(),
            args,
            reply_tx,
        };
        if let Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) = self.sender.try_send(req) {
            return Err(CallError::Timeout);
        }
        match reply_rx.recv() {
            Ok(ReplyMsg::Ok(bytes)) => Ok(bytes),
            Ok(ReplyMsg::Fail) | Err(_) => Err(CallError::Timeout),
        }
    }

    fn process_req(&self, req: Request) {
        let (enabled, server_id, host, reliable, long_reordering) = {
            let state = self.state.lock().unwrap();
            let end = state.ends.get(&req.endname);
            let enabled = end.map(|e| e.enabled).unwrap_or(false);
            let server_id = end.and_then(|e| e.server_id);
            let host = server_id.and_then(|id| state.servers.get(&id).cloned());
            (enabled, server_id, host, state.reliable, state.long_reordering)
        };

        let (server_id, host) = match (server_id, host) {
            (Some(server_id), Some(host)) if enabled => (server_id, host),
            _ => {
                let ms = if self.state.lock().unwrap().long_delays {
                    rand::thread_rng().gen_range(0..=DISABLED_LONG_DELAY_MS)
                } else {
                    rand::thread_rng().gen_range(0..=DISABLED_DELAY_MS)
                };
                thread::sleep(Duration::from_millis(ms));
                let _ = req.reply_tx.send(ReplyMsg::Fail);
                return;
            }
        };

        if !reliable {
            let jitter = rand::thread_rng().gen_range(0..=UNRELIABLE_JITTER_MS);
            thread::sleep(Duration::from_millis(jitter));
        }
        if !reliable && rand::thread_rng().gen_range(0..1000) < UNRELIABLE_DROP_PER_MILLE {
            trace!(endname = %req.endname, "unreliable pre-delivery drop");
            let _ = req.reply_tx.send(ReplyMsg::Fail);
            return;
        }

        let (host_tx, host_rx) = mpsc::channel();
        let svc_method = req.svc_method.clone();
        let args = req.args.clone();
        let dispatch_host = host.clone();
        thread::spawn(move || {
            let outcome = dispatch_host.dispatch(&svc_method, &args);
            let _ = host_tx.send(outcome);
        });

        let outcome = loop {
            match host_rx.recv_timeout(LIVENESS_POLL) {
                Ok(outcome) => break Some(outcome),
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_server_dead(&req.endname, server_id, &host) {
                        debug!(endname = %req.endname, server_id, "server died mid-call");
                        break None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break None,
            }
        };

        let reply = match outcome {
            None => ReplyMsg::Fail,
            Some(MethodOutcome::DecodeError) => ReplyMsg::Fail,
            Some(MethodOutcome::Ok(bytes)) => ReplyMsg::Ok(bytes),
        };

        if matches!(reply, ReplyMsg::Ok(_)) && !reliable
            && rand::thread_rng().gen_range(0..1000) < UNRELIABLE_DROP_PER_MILLE
        {
            trace!(endname = %req.endname, "unreliable post-delivery drop");
            let _ = req.reply_tx.send(ReplyMsg::Fail);
            return;
        }

        if matches!(reply, ReplyMsg::Ok(_)) && long_reordering
            && rand::thread_rng().gen_range(0..900) < LONG_REORDER_PER_900
        {
            let ms = LONG_REORDER_BASE_MS + rand::thread_rng().gen_range(0..=LONG_REORDER_SPREAD_MS);
            let reply_tx = req.reply_tx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                let _ = reply_tx.send(reply);
            });
            return;
        }

        let _ = req.reply_tx.send(reply);
    }

    /// A host is dead to a pending call if its endpoint got disabled, or
    /// the registered host for `server_id` is no longer the one we
    /// dispatched to (a restart swapped it out from under us).
    fn is_server_dead(&self, endname: &str, server_id: u64, host: &Arc<ServerHost>) -> bool {
        let state = self.state.lock().unwrap();
        let still_enabled = state.ends.get(endname).map(|e| e.enabled).unwrap_or(false);
        let still_same_host = state
            .servers
            .get(&server_id)
            .map(|current| Arc::ptr_eq(current, host))
            .unwrap_or(false);
        !still_enabled || !still_same_host
    }
}
