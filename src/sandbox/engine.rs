//! QuickJS worker that hosts one instance's code.
//!
//! ```text
//!  async side                          worker thread (owns Runtime + Context)
//!  ──────────                          ──────────────────────────────────────
//!  launch() ── spawn ───────────────►  prelude, run(code) under deadline
//!           ◄── oneshot Harvest ─────
//!  ScriptHandle ── ScriptCommand ───►  settleLogin / dispatch / shutdown
//!  outbound rx  ◄── OutboundAction ──  message.reply(), channel.send()
//!                                      timers fire between commands
//! ```
//!
//! Every turn (the top-level run, each dispatch, each timer) gets the same
//! wall-clock budget. The interrupt handler aborts a turn that overruns it;
//! an aborted top-level run fails the launch, an aborted handler is logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Context, Ctx, Function, Object, Persistent, Runtime};
use secrecy::SecretString;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::gateway::{GatewayEvent, Intents, OutboundAction, ReadyInfo, client_event_name};
use crate::sandbox::environment::{Environment, LogLevel};

const PRELUDE: &str = include_str!("prelude.js");

/// Floor for the worker thread's native stack.
const MIN_WORKER_STACK: usize = 4 * 1024 * 1024;

/// Where the harvested client came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientSource {
    /// `module.exports` (or `module.exports.client`) is a client.
    Exports,
    /// First client the code constructed.
    Constructed,
    /// No client found; the runtime made one.
    Default,
}

/// The client handle produced by running bot code.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Harvest {
    pub source: ClientSource,
    pub intents: u64,
    pub login_called: bool,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub login_token: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl Harvest {
    pub fn intents(&self) -> Intents {
        Intents(self.intents)
    }
}

#[derive(Debug, Deserialize)]
struct RunOutcome {
    ok: bool,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    client: Option<Harvest>,
}

impl RunOutcome {
    fn into_result(self) -> Result<Harvest, SandboxError> {
        if self.ok {
            return self.client.ok_or_else(|| SandboxError::Execution {
                message: "script produced no client".to_string(),
            });
        }
        match self.kind.as_deref() {
            Some("module_not_available") => Err(SandboxError::ModuleNotAvailable {
                module: self.module.unwrap_or_default(),
            }),
            _ => Err(SandboxError::Execution {
                message: self.message.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }
}

enum ScriptCommand {
    SettleLogin(Result<ReadyInfo, String>),
    Dispatch(GatewayEvent),
    Shutdown,
}

/// A launched script: its control handle, what it produced, and its outbound actions.
pub struct LaunchedScript {
    pub handle: ScriptHandle,
    pub harvest: Harvest,
    pub outbound: mpsc::Receiver<OutboundAction>,
}

/// Control handle for a running worker. Dropping it stops the worker.
pub struct ScriptHandle {
    commands: std_mpsc::Sender<ScriptCommand>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ScriptHandle {
    /// Resolve (or reject) the script's pending `login()` promises.
    pub fn settle_login(&self, result: Result<&ReadyInfo, String>) -> Result<(), SandboxError> {
        self.send(ScriptCommand::SettleLogin(result.cloned()))
    }

    /// Deliver a gateway event to the harvested client.
    pub fn dispatch(&self, event: GatewayEvent) -> Result<(), SandboxError> {
        self.send(ScriptCommand::Dispatch(event))
    }

    /// Stop the worker and wait for its thread to exit. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(ScriptCommand::Shutdown);
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker
            && let Err(e) = tokio::task::spawn_blocking(move || worker.join()).await
        {
            tracing::warn!("Sandbox worker join failed: {}", e);
        }
    }

    fn send(&self, command: ScriptCommand) -> Result<(), SandboxError> {
        self.commands
            .send(command)
            .map_err(|_| SandboxError::WorkerGone)
    }
}

impl Drop for ScriptHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(ScriptCommand::Shutdown);
    }
}

/// Start a worker for `source` inside `environment` and wait for the top-level run.
pub async fn launch(
    environment: Environment,
    source: String,
    config: &SandboxConfig,
) -> Result<LaunchedScript, SandboxError> {
    let (command_tx, command_rx) = std_mpsc::channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.max_pending_sends.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let limits = config.clone();

    let thread_name: String = environment
        .name()
        .chars()
        .filter(|c| *c != '\0')
        .take(24)
        .collect();
    let worker = thread::Builder::new()
        .name(format!("bothost-js-{thread_name}"))
        .stack_size(config.max_stack_size.saturating_mul(4).max(MIN_WORKER_STACK))
        .spawn(move || {
            let worker = match Worker::new(&environment, &limits, outbound_tx) {
                Ok(worker) => worker,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let harvest = worker.evaluate(source);
            let failed = harvest.is_err();
            if ready_tx.send(harvest).is_err() || failed {
                return;
            }
            worker.serve(command_rx);
        })
        .map_err(|e| SandboxError::Startup(format!("failed to spawn worker: {e}")))?;

    let harvest = ready_rx.await.map_err(|_| SandboxError::WorkerGone)??;
    Ok(LaunchedScript {
        handle: ScriptHandle {
            commands: command_tx,
            worker: Mutex::new(Some(worker)),
        },
        harvest,
        outbound: outbound_rx,
    })
}

/// Pending timers for one worker.
#[derive(Debug)]
struct TimerQueue {
    due: HashMap<u32, Instant>,
    capacity: usize,
}

impl TimerQueue {
    fn new(capacity: usize) -> Self {
        Self {
            due: HashMap::new(),
            capacity,
        }
    }

    fn arm(&mut self, id: u32, delay: Duration) -> bool {
        if !self.due.contains_key(&id) && self.due.len() >= self.capacity {
            return false;
        }
        self.due.insert(id, Instant::now() + delay);
        true
    }

    fn cancel(&mut self, id: u32) {
        self.due.remove(&id);
    }

    fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    /// Remove and return timers due at `now`, earliest first.
    fn take_due(&mut self, now: Instant) -> Vec<u32> {
        let mut fired: Vec<(Instant, u32)> = self
            .due
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*at, *id))
            .collect();
        fired.sort();
        for (_, id) in &fired {
            self.due.remove(id);
        }
        fired.into_iter().map(|(_, id)| id).collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Worker {
    // Field order matters: the control object drops before the context,
    // and the context before its runtime.
    control: Persistent<Object<'static>>,
    context: Context,
    runtime: Runtime,
    deadline: Arc<Mutex<Option<Instant>>>,
    timed_out: Arc<AtomicBool>,
    timers: Arc<Mutex<TimerQueue>>,
    budget: Duration,
    environment: Environment,
}

impl Worker {
    fn new(
        environment: &Environment,
        config: &SandboxConfig,
        outbound: mpsc::Sender<OutboundAction>,
    ) -> Result<Self, SandboxError> {
        let startup = |e: rquickjs::Error| SandboxError::Startup(e.to_string());

        let runtime = Runtime::new().map_err(startup)?;
        runtime.set_memory_limit(config.memory_limit);
        runtime.set_max_stack_size(config.max_stack_size);

        let deadline: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let timed_out = Arc::new(AtomicBool::new(false));
        {
            let deadline = Arc::clone(&deadline);
            let timed_out = Arc::clone(&timed_out);
            runtime.set_interrupt_handler(Some(Box::new(move || {
                let expired = lock(&deadline).is_some_and(|at| Instant::now() >= at);
                if expired {
                    timed_out.store(true, Ordering::SeqCst);
                }
                expired
            })));
        }

        let context = Context::full(&runtime).map_err(startup)?;
        let timers = Arc::new(Mutex::new(TimerQueue::new(config.max_timers)));

        let control = context.with(|ctx| {
            install(&ctx, environment, Arc::clone(&timers), outbound)
                .catch(&ctx)
                .map(|control| Persistent::save(&ctx, control))
                .map_err(|e| SandboxError::Startup(e.to_string()))
        })?;

        Ok(Self {
            control,
            context,
            runtime,
            deadline,
            timed_out,
            timers,
            budget: config.execution_timeout,
            environment: environment.clone(),
        })
    }

    fn evaluate(&self, source: String) -> Result<Harvest, SandboxError> {
        let raw: String = self.turn(move |_, control| {
            let run: Function = control.get("run")?;
            run.call((source,))
        })?;
        let outcome: RunOutcome = serde_json::from_str(&raw).map_err(|e| SandboxError::Execution {
            message: format!("malformed run outcome: {e}"),
        })?;
        outcome.into_result()
    }

    fn serve(self, commands: std_mpsc::Receiver<ScriptCommand>) {
        loop {
            let next_due = lock(&self.timers).next_due();
            let received = match next_due {
                Some(at) => commands.recv_timeout(at.saturating_duration_since(Instant::now())),
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(ScriptCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.fire_due_timers();
        }
        tracing::debug!(instance = %self.environment.name(), "Sandbox worker stopped");
    }

    fn handle(&self, command: ScriptCommand) {
        let (what, result) = match command {
            ScriptCommand::SettleLogin(result) => {
                let (ok, detail) = match result {
                    Ok(ready) => (true, serde_json::to_string(&ready).unwrap_or_default()),
                    Err(reason) => (false, reason),
                };
                let result = self.turn(move |_, control| {
                    let settle: Function = control.get("settleLogin")?;
                    settle.call::<_, ()>((ok, detail))
                });
                ("login", result)
            }
            ScriptCommand::Dispatch(event) => {
                let name = client_event_name(&event.name);
                let payload = event.payload.to_string();
                let result = self.turn(move |_, control| {
                    let dispatch: Function = control.get("dispatch")?;
                    dispatch.call::<_, bool>((name, payload)).map(|_| ())
                });
                ("event", result)
            }
            ScriptCommand::Shutdown => return,
        };
        self.report(what, result);
    }

    fn fire_due_timers(&self) {
        let fired = lock(&self.timers).take_due(Instant::now());
        for id in fired {
            let result = self.turn(move |_, control| {
                let fire: Function = control.get("fireTimer")?;
                fire.call::<_, ()>((id,))
            });
            self.report("timer", result);
        }
    }

    fn report(&self, what: &str, result: Result<(), SandboxError>) {
        match result {
            Ok(()) => {}
            Err(SandboxError::Timeout { timeout_ms }) => self.environment.console().emit(
                LogLevel::Warn,
                &format!("{what} handler aborted after {timeout_ms}ms"),
            ),
            Err(e) => self
                .environment
                .console()
                .emit(LogLevel::Error, &format!("{what} handler failed: {e}")),
        }
    }

    /// Run one turn under the execution budget, then drain the job queue.
    ///
    /// `f` receives the prelude's control object.
    fn turn<T, F>(&self, f: F) -> Result<T, SandboxError>
    where
        F: for<'js> FnOnce(Ctx<'js>, Object<'js>) -> rquickjs::Result<T>,
    {
        self.timed_out.store(false, Ordering::SeqCst);
        *lock(&self.deadline) = Some(Instant::now() + self.budget);

        let result = self.context.with(|ctx| {
            self.control
                .clone()
                .restore(&ctx)
                .and_then(|control| f(ctx.clone(), control))
                .catch(&ctx)
                .map_err(|e| e.to_string())
        });
        self.drain_jobs();

        *lock(&self.deadline) = None;
        if self.timed_out.swap(false, Ordering::SeqCst) {
            return Err(SandboxError::Timeout {
                timeout_ms: self.budget.as_millis() as u64,
            });
        }
        result.map_err(|message| SandboxError::Execution { message })
    }

    /// Run queued promise jobs until the queue is empty or the turn times out.
    ///
    /// A failed job leaves its exception pending on the context; it has to be
    /// taken off before the next job runs or the runtime is freed.
    fn drain_jobs(&self) {
        while !self.timed_out.load(Ordering::SeqCst) {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(failed) => {
                    let detail = failed.0.with(|ctx| describe_exception(&ctx.catch()));
                    if !self.timed_out.load(Ordering::SeqCst) {
                        self.environment.console().emit(
                            LogLevel::Error,
                            &format!("uncaught exception in promise job: {detail}"),
                        );
                    }
                }
            }
        }
    }
}

fn describe_exception(value: &rquickjs::Value<'_>) -> String {
    if let Some(exception) = value.as_exception() {
        return exception.message().unwrap_or_else(|| "unknown error".to_string());
    }
    value
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| value.type_name().to_string())
}

/// Install host functions and evaluate the prelude.
fn install<'js>(
    ctx: &Ctx<'js>,
    environment: &Environment,
    timers: Arc<Mutex<TimerQueue>>,
    outbound: mpsc::Sender<OutboundAction>,
) -> rquickjs::Result<Object<'js>> {
    let host = Object::new(ctx.clone())?;

    let console = environment.console().clone();
    host.set(
        "log",
        Function::new(ctx.clone(), move |level: String, message: String| {
            console.emit(LogLevel::parse(&level), &message);
        })?,
    )?;

    let resolver = environment.clone();
    host.set(
        "resolve",
        Function::new(ctx.clone(), move |module: String| -> bool {
            match resolver.resolve_module(&module) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(instance = %resolver.name(), "Blocked require: {}", e);
                    false
                }
            }
        })?,
    )?;

    host.set(
        "send",
        Function::new(ctx.clone(), move |channel_id: String, body: String| -> bool {
            let Ok(body) = serde_json::from_str(&body) else {
                return false;
            };
            // Full means the pump is behind; refuse rather than buffer without bound.
            outbound
                .try_send(OutboundAction::SendMessage { channel_id, body })
                .is_ok()
        })?,
    )?;

    let arm = Arc::clone(&timers);
    host.set(
        "timer",
        Function::new(ctx.clone(), move |id: u32, delay_ms: f64| -> bool {
            let delay = Duration::from_millis(delay_ms.max(0.0) as u64);
            lock(&arm).arm(id, delay)
        })?,
    )?;
    host.set(
        "clearTimer",
        Function::new(ctx.clone(), move |id: u32| {
            lock(&timers).cancel(id);
        })?,
    )?;

    let factory: Function = ctx.eval(PRELUDE)?;
    factory.call((host, environment.prelude_config().to_string()))
}
