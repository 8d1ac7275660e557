//! The execution context behind the adapter surface.
//!
//! Every adapter owns one dispatcher. In isolated mode (the default) the
//! dispatcher is a spawned task draining an unbounded channel of envelopes;
//! because submission is synchronous, channel order is exactly call order
//! and the backend observes strict FIFO. In inline mode the same worker
//! logic runs on the caller's thread behind a mutex.
//!
//! Setup is itself an envelope, enqueued before anything else can be, so no
//! call can ever reach a backend that has not finished `set_up`. A fatal
//! error (setup failure, exhausted write capacity) moves the worker to a
//! terminal state: the in-flight call still reports its own error, and every
//! later call is rejected with the fatal condition.

use crate::{
    backend::StorageBackend,
    call::{CallEnvelope, CallResult, DbCall, ReplySender},
    clone::ClonePolicy,
    config::{FatalErrorHook, SetUpErrorHook},
    error::{AdapterError, Result},
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Constructs the backend inside the execution context, so the storage
/// engine's connection never leaves the thread that uses it.
pub type BackendFactory = Box<dyn FnOnce() -> Result<Box<dyn StorageBackend>> + Send>;

/// Dispatcher tuning, independent of which backend runs inside.
pub struct DispatcherOptions {
    pub isolated: bool,
    pub autosave: bool,
    pub autosave_interval: Duration,
    pub on_setup_error: Option<SetUpErrorHook>,
    pub on_quota_exceeded_error: Option<FatalErrorHook>,
}

enum Envelope {
    SetUp {
        factory: BackendFactory,
        reply: Option<ReplySender>,
    },
    Call(CallEnvelope),
    Close {
        reply: Option<ReplySender>,
    },
}

enum WorkerState {
    SettingUp,
    Ready,
    /// Terminal. The stored error is replied to every rejected call.
    Fatal(AdapterError),
}

/// The single-owner execution core shared by both modes.
struct Worker {
    backend: Option<Box<dyn StorageBackend>>,
    state: WorkerState,
    on_setup_error: Option<SetUpErrorHook>,
    on_quota_exceeded_error: Option<FatalErrorHook>,
}

impl Worker {
    fn new(
        on_setup_error: Option<SetUpErrorHook>,
        on_quota_exceeded_error: Option<FatalErrorHook>,
    ) -> Self {
        Self {
            backend: None,
            state: WorkerState::SettingUp,
            on_setup_error,
            on_quota_exceeded_error,
        }
    }

    fn set_up(&mut self, factory: BackendFactory) -> Result<CallResult> {
        match self.try_set_up(factory) {
            Ok(()) => {
                self.state = WorkerState::Ready;
                tracing::debug!("backend ready");
                Ok(CallResult::Done)
            }
            Err(err) => {
                let fatal = match err {
                    AdapterError::SetUpFailure(_) => err,
                    other => AdapterError::SetUpFailure(other.to_string()),
                };
                tracing::error!(error = %fatal, "backend setup failed");
                self.state = WorkerState::Fatal(fatal.clone());
                self.backend = None;
                if let Some(hook) = self.on_setup_error.take() {
                    hook(fatal.clone());
                }
                Err(fatal)
            }
        }
    }

    fn try_set_up(&mut self, factory: BackendFactory) -> Result<()> {
        let mut backend = factory()?;
        backend.set_up()?;
        self.backend = Some(backend);
        Ok(())
    }

    fn execute(&mut self, call: DbCall, result_policy: ClonePolicy) -> Result<CallResult> {
        match &self.state {
            WorkerState::Ready => {}
            WorkerState::Fatal(err) => return Err(err.clone()),
            WorkerState::SettingUp => {
                // Unreachable in practice: the setup envelope is always first
                return Err(AdapterError::Fatal("backend is not set up".into()));
            }
        }
        // Presence follows from Ready
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| AdapterError::Fatal("backend is not set up".into()))?;

        let method = call.method();
        let result = run_call(backend.as_mut(), call, result_policy);
        if let Err(err) = &result {
            tracing::warn!(method, error = %err, "call failed");
            if err.is_fatal() {
                self.enter_fatal(err.clone());
            }
        }
        result
    }

    fn enter_fatal(&mut self, err: AdapterError) {
        tracing::error!(error = %err, "entering fatal state");
        if matches!(err, AdapterError::QuotaExceeded(_)) {
            if let Some(hook) = self.on_quota_exceeded_error.take() {
                hook(err.clone());
            }
        }
        self.state = WorkerState::Fatal(err);
    }

    fn autosave(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            if let Err(err) = backend.autosave_tick() {
                tracing::warn!(error = %err, "autosave failed");
                if err.is_fatal() {
                    self.enter_fatal(err);
                }
            }
        }
    }

    fn close(&mut self) -> Result<CallResult> {
        if let Some(mut backend) = self.backend.take() {
            backend.close()?;
        }
        self.state = WorkerState::Fatal(AdapterError::Fatal("adapter closed".into()));
        Ok(CallResult::Done)
    }
}

fn run_call(
    backend: &mut dyn StorageBackend,
    call: DbCall,
    result_policy: ClonePolicy,
) -> Result<CallResult> {
    match call {
        DbCall::Find { table, id } => {
            let record = backend.find(&table, &id)?;
            Ok(CallResult::Record(
                record.map(|r| result_policy.apply_record(&r)),
            ))
        }
        DbCall::Query { query } => {
            let records = backend.query(&query)?;
            Ok(CallResult::Records(result_policy.apply_records(records)))
        }
        DbCall::QueryIds { query } => Ok(CallResult::Ids(backend.query_ids(&query)?)),
        DbCall::UnsafeQueryRaw { query } => Ok(CallResult::Rows(backend.unsafe_query_raw(&query)?)),
        DbCall::Count { query } => Ok(CallResult::Count(backend.count(&query)?)),
        DbCall::Batch { operations } => {
            backend.batch(&operations)?;
            Ok(CallResult::Done)
        }
        DbCall::GetDeletedRecords { table } => {
            Ok(CallResult::Ids(backend.get_deleted_records(&table)?))
        }
        DbCall::UnsafeExecute { statements } => {
            backend.unsafe_execute(&statements)?;
            Ok(CallResult::Done)
        }
        DbCall::GetLocal { key } => Ok(CallResult::Local(backend.get_local(&key)?)),
        DbCall::SetLocal { key, value } => {
            backend.set_local(&key, &value)?;
            Ok(CallResult::Done)
        }
        DbCall::RemoveLocal { key } => {
            backend.remove_local(&key)?;
            Ok(CallResult::Done)
        }
        DbCall::UnsafeResetDatabase => {
            backend.unsafe_reset()?;
            Ok(CallResult::Done)
        }
    }
}

enum Inner {
    Isolated {
        tx: mpsc::UnboundedSender<Envelope>,
    },
    Inline {
        worker: Arc<Mutex<Worker>>,
        autosave: bool,
    },
}

/// Handle to the execution context. Cloned freely; all clones feed the same
/// FIFO.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Start a dispatcher and enqueue backend setup as its first unit of
    /// work. Must be called from within a tokio runtime when isolated.
    pub fn start(factory: BackendFactory, options: DispatcherOptions) -> Self {
        let mut worker = Worker::new(options.on_setup_error, options.on_quota_exceeded_error);

        if !options.isolated {
            // Inline mode: set up synchronously, execute on the caller's
            // thread from then on.
            let _ = worker.set_up(factory);
            return Self {
                inner: Arc::new(Inner::Inline {
                    worker: Arc::new(Mutex::new(worker)),
                    autosave: options.autosave,
                }),
            };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let autosave = options.autosave;
        let autosave_interval = options.autosave_interval;
        // Enqueued before the task spawns, so setup is always first in line
        let _ = tx.send(Envelope::SetUp {
            factory,
            reply: None,
        });
        tokio::spawn(run_loop(worker, rx, autosave, autosave_interval));

        Self {
            inner: Arc::new(Inner::Isolated { tx }),
        }
    }

    /// Submit one call. The call's FIFO position is fixed before this
    /// returns; the receiver resolves when the backend has executed it.
    pub fn submit(
        &self,
        call: DbCall,
        arg_policy: ClonePolicy,
        result_policy: ClonePolicy,
    ) -> Result<oneshot::Receiver<Result<CallResult>>> {
        let (reply, rx) = oneshot::channel();
        match self.inner.as_ref() {
            Inner::Isolated { tx } => {
                let envelope = Envelope::Call(CallEnvelope {
                    call,
                    arg_policy,
                    result_policy,
                    reply,
                });
                tx.send(envelope)
                    .map_err(|_| AdapterError::Fatal("dispatcher is closed".into()))?;
            }
            Inner::Inline { worker, autosave } => {
                let mut worker = worker.lock();
                let result = worker.execute(call, result_policy);
                if *autosave {
                    worker.autosave();
                }
                let _ = reply.send(result);
            }
        }
        Ok(rx)
    }

    /// Flush and shut down. Queued calls ahead of the close still run.
    pub fn close(&self) -> Result<oneshot::Receiver<Result<CallResult>>> {
        let (reply, rx) = oneshot::channel();
        match self.inner.as_ref() {
            Inner::Isolated { tx } => {
                tx.send(Envelope::Close { reply: Some(reply) })
                    .map_err(|_| AdapterError::Fatal("dispatcher is closed".into()))?;
            }
            Inner::Inline { worker, .. } => {
                let result = worker.lock().close();
                let _ = reply.send(result);
            }
        }
        Ok(rx)
    }
}

async fn run_loop(
    mut worker: Worker,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    autosave: bool,
    autosave_interval: Duration,
) {
    let mut ticker = tokio::time::interval(autosave_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(Envelope::SetUp { factory, reply }) => {
                    let result = worker.set_up(factory);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Some(Envelope::Call(envelope)) => {
                    let result = worker.execute(envelope.call, envelope.result_policy);
                    let _ = envelope.reply.send(result);
                }
                Some(Envelope::Close { reply }) => {
                    let result = worker.close();
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    break;
                }
                None => {
                    // All senders dropped: flush and stop
                    let _ = worker.close();
                    break;
                }
            },
            _ = ticker.tick(), if autosave => {
                worker.autosave();
            }
        }
    }
    rx.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that records every mutation in submission order.
    struct RecordingBackend {
        log: Arc<Mutex<Vec<String>>>,
        fail_batches: bool,
    }

    impl StorageBackend for RecordingBackend {
        fn set_up(&mut self) -> Result<()> {
            self.log.lock().push("set_up".into());
            Ok(())
        }
        fn find(
            &mut self,
            _table: &String,
            _id: &String,
        ) -> Result<Option<duffel_store::RawRecord>> {
            Ok(None)
        }
        fn query(
            &mut self,
            _query: &duffel_store::SerializedQuery,
        ) -> Result<Vec<duffel_store::RawRecord>> {
            Ok(Vec::new())
        }
        fn query_ids(&mut self, _query: &duffel_store::SerializedQuery) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn unsafe_query_raw(
            &mut self,
            _query: &duffel_store::SerializedQuery,
        ) -> Result<Vec<serde_json::Value>> {
            Ok(Vec::new())
        }
        fn count(&mut self, _query: &duffel_store::SerializedQuery) -> Result<usize> {
            Ok(0)
        }
        fn batch(&mut self, _operations: &[duffel_store::BatchOperation]) -> Result<()> {
            if self.fail_batches {
                return Err(AdapterError::QuotaExceeded("disk full".into()));
            }
            self.log.lock().push("batch".into());
            Ok(())
        }
        fn get_deleted_records(&mut self, _table: &String) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn unsafe_execute(&mut self, _statements: &[crate::call::RawStatement]) -> Result<()> {
            Ok(())
        }
        fn get_local(&mut self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn set_local(&mut self, key: &str, _value: &str) -> Result<()> {
            self.log.lock().push(format!("set_local:{}", key));
            Ok(())
        }
        fn remove_local(&mut self, _key: &str) -> Result<()> {
            Ok(())
        }
        fn unsafe_reset(&mut self) -> Result<()> {
            Ok(())
        }
        fn user_version(&mut self) -> Result<u32> {
            Ok(1)
        }
        fn close(&mut self) -> Result<()> {
            self.log.lock().push("close".into());
            Ok(())
        }
    }

    fn recording_factory(log: Arc<Mutex<Vec<String>>>, fail_batches: bool) -> BackendFactory {
        Box::new(move || {
            Ok(Box::new(RecordingBackend { log, fail_batches }) as Box<dyn StorageBackend>)
        })
    }

    fn options() -> DispatcherOptions {
        DispatcherOptions {
            isolated: true,
            autosave: false,
            autosave_interval: Duration::from_millis(500),
            on_setup_error: None,
            on_quota_exceeded_error: None,
        }
    }

    fn set_local_call(key: &str) -> DbCall {
        DbCall::SetLocal {
            key: key.into(),
            value: "v".into(),
        }
    }

    async fn done(rx: oneshot::Receiver<Result<CallResult>>) -> Result<()> {
        CallHandle::new(rx, CallResult::into_done).await
    }

    #[tokio::test]
    async fn calls_run_in_submission_order_after_set_up() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::start(recording_factory(Arc::clone(&log), false), options());

        let mut receivers = Vec::new();
        for i in 0..10 {
            receivers.push(
                dispatcher
                    .submit(
                        set_local_call(&format!("k{}", i)),
                        ClonePolicy::Immutable,
                        ClonePolicy::Immutable,
                    )
                    .unwrap(),
            );
        }
        // Await out of order; execution order must not change
        for rx in receivers.into_iter().rev() {
            done(rx).await.unwrap();
        }

        let log = log.lock();
        assert_eq!(log[0], "set_up");
        let keys: Vec<&String> = log.iter().skip(1).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("set_local:k{}", i)).collect();
        assert_eq!(keys, expected.iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn setup_failure_fires_hook_and_rejects_later_calls() {
        let (hook_tx, hook_rx) = oneshot::channel();
        let mut opts = options();
        opts.on_setup_error = Some(Box::new(move |err| {
            let _ = hook_tx.send(err);
        }));

        let factory: BackendFactory =
            Box::new(|| Err(AdapterError::SetUpFailure("corrupt file".into())));
        let dispatcher = Dispatcher::start(factory, opts);

        let err = hook_rx.await.unwrap();
        assert!(matches!(err, AdapterError::SetUpFailure(_)));

        let rx = dispatcher
            .submit(
                set_local_call("k"),
                ClonePolicy::Immutable,
                ClonePolicy::Immutable,
            )
            .unwrap();
        assert!(matches!(
            done(rx).await,
            Err(AdapterError::SetUpFailure(_))
        ));
    }

    #[tokio::test]
    async fn quota_exceeded_is_fatal_and_fires_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hook_count = Arc::new(AtomicUsize::new(0));
        let hook_count_in_hook = Arc::clone(&hook_count);

        let mut opts = options();
        opts.on_quota_exceeded_error = Some(Box::new(move |_| {
            hook_count_in_hook.fetch_add(1, Ordering::SeqCst);
        }));
        let dispatcher = Dispatcher::start(recording_factory(Arc::clone(&log), true), opts);

        let rx = dispatcher
            .submit(
                DbCall::Batch {
                    operations: Vec::new(),
                },
                ClonePolicy::Immutable,
                ClonePolicy::Immutable,
            )
            .unwrap();
        assert!(matches!(done(rx).await, Err(AdapterError::QuotaExceeded(_))));
        assert_eq!(hook_count.load(Ordering::SeqCst), 1);

        // Subsequent calls are rejected with the fatal condition, without
        // reaching the backend
        let rx = dispatcher
            .submit(
                set_local_call("after"),
                ClonePolicy::Immutable,
                ClonePolicy::Immutable,
            )
            .unwrap();
        assert!(matches!(done(rx).await, Err(AdapterError::QuotaExceeded(_))));
        assert!(!log.lock().iter().any(|entry| entry == "set_local:after"));
    }

    #[tokio::test]
    async fn close_flushes_and_rejects_further_submissions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::start(recording_factory(Arc::clone(&log), false), options());

        let rx = dispatcher.close().unwrap();
        done(rx).await.unwrap();
        assert!(log.lock().contains(&"close".to_string()));

        let result = dispatcher.submit(
            set_local_call("k"),
            ClonePolicy::Immutable,
            ClonePolicy::Immutable,
        );
        assert!(matches!(result, Err(AdapterError::Fatal(_))));
    }

    #[tokio::test]
    async fn inline_mode_executes_on_the_caller() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut opts = options();
        opts.isolated = false;
        let dispatcher = Dispatcher::start(recording_factory(Arc::clone(&log), false), opts);

        // The reply is already resolved when submit returns
        let mut rx = dispatcher
            .submit(
                set_local_call("k"),
                ClonePolicy::Immutable,
                ClonePolicy::Immutable,
            )
            .unwrap();
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(
            log.lock().as_slice(),
            ["set_up".to_string(), "set_local:k".to_string()]
        );
    }

    #[tokio::test]
    async fn autosave_tick_runs_periodically() {
        struct TickBackend {
            ticks: Arc<AtomicUsize>,
        }
        impl StorageBackend for TickBackend {
            fn set_up(&mut self) -> Result<()> {
                Ok(())
            }
            fn find(
                &mut self,
                _t: &String,
                _i: &String,
            ) -> Result<Option<duffel_store::RawRecord>> {
                Ok(None)
            }
            fn query(
                &mut self,
                _q: &duffel_store::SerializedQuery,
            ) -> Result<Vec<duffel_store::RawRecord>> {
                Ok(Vec::new())
            }
            fn query_ids(&mut self, _q: &duffel_store::SerializedQuery) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn unsafe_query_raw(
                &mut self,
                _q: &duffel_store::SerializedQuery,
            ) -> Result<Vec<serde_json::Value>> {
                Ok(Vec::new())
            }
            fn count(&mut self, _q: &duffel_store::SerializedQuery) -> Result<usize> {
                Ok(0)
            }
            fn batch(&mut self, _o: &[duffel_store::BatchOperation]) -> Result<()> {
                Ok(())
            }
            fn get_deleted_records(&mut self, _t: &String) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            fn unsafe_execute(&mut self, _s: &[crate::call::RawStatement]) -> Result<()> {
                Ok(())
            }
            fn get_local(&mut self, _k: &str) -> Result<Option<String>> {
                Ok(None)
            }
            fn set_local(&mut self, _k: &str, _v: &str) -> Result<()> {
                Ok(())
            }
            fn remove_local(&mut self, _k: &str) -> Result<()> {
                Ok(())
            }
            fn unsafe_reset(&mut self) -> Result<()> {
                Ok(())
            }
            fn user_version(&mut self) -> Result<u32> {
                Ok(1)
            }
            fn autosave_tick(&mut self) -> Result<()> {
                self.ticks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_in_factory = Arc::clone(&ticks);
        let factory: BackendFactory = Box::new(move || {
            Ok(Box::new(TickBackend {
                ticks: ticks_in_factory,
            }) as Box<dyn StorageBackend>)
        });

        let mut opts = options();
        opts.autosave = true;
        opts.autosave_interval = Duration::from_millis(10);
        let _dispatcher = Dispatcher::start(factory, opts);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}
