//! Delivery pipeline: the object a host application owns.
//!
//! ```rust,no_run
//! use courier_core::{Config, Envelope, Hint, Item, ItemType, Pipeline};
//! use std::time::Duration;
//!
//! let mut config = Config::default();
//! config.dsn = Some("https://public@o0.ingest.example.com/123".to_string());
//!
//! let pipeline = Pipeline::new(config);
//! let item = Item::json(ItemType::Event, &serde_json::json!({"message": "boom"}))?;
//! pipeline.capture(Envelope::from_item(item), Hint::new());
//! pipeline.flush(Duration::from_secs(2));
//! pipeline.close();
//! # Ok::<(), courier_core::Error>(())
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::buffer::{open_buffer, BufferFlusher, BufferSink, EnvelopeBuffer, FlushSummary};
use crate::client_report::ClientReportRecorder;
use crate::config::Config;
use crate::dsn::Dsn;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::rate_limit::{Clock, RateLimiter, SystemClock};
use crate::transport::{Connection, ConnectionRegistry, Connectivity, Hint, Transport};

/// Extra time the flusher waits for a resend beyond the request timeouts
const RESEND_MARGIN: Duration = Duration::from_secs(1);

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    config: Config,
    handle: Option<Handle>,
    registry: ConnectionRegistry,
    connection: Option<Arc<dyn Connection>>,
    clock: Arc<dyn Clock>,
}

impl PipelineBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            handle: None,
            registry: ConnectionRegistry::default(),
            connection: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Spawn onto an existing runtime instead of creating one
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Resolve the DSN scheme through this registry
    pub fn registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use this connection regardless of the DSN scheme
    pub fn connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Time source for rate limit expiry
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the pipeline, failing on invalid configuration
    pub fn build(self) -> Result<Pipeline> {
        let mut config = self.config;
        config.validate()?;
        let dsn = config.parsed_dsn()?;
        config.apply_dsn_options(&dsn);
        config.validate()?;

        let connection = match self.connection {
            Some(connection) => connection,
            None => self.registry.create(&dsn, &config.transport)?,
        };

        let (runtime, handle) = match self.handle {
            Some(handle) => (None, handle),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("courier-transport")
                    .enable_all()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let recorder = Arc::new(ClientReportRecorder::new());
        let rate_limiter = Arc::new(
            RateLimiter::with_clock(Arc::clone(&recorder), self.clock)
                .with_default_retry_after(config.transport.default_retry_after()),
        );
        let buffer = open_buffer(&config.buffer, Arc::clone(&recorder));
        let sink = Arc::new(BufferSink::new(Arc::clone(&buffer), Arc::clone(&recorder)));
        let transport = Arc::new(
            Transport::new(
                config.transport.clone(),
                connection,
                rate_limiter,
                Arc::clone(&recorder),
                handle.clone(),
            )
            .with_retry_sink(sink),
        );

        let flusher = Arc::new(BufferFlusher::new(
            Arc::clone(&transport),
            Arc::clone(&buffer),
            config.buffer.flush_interval(),
            config.transport.connect_timeout() + config.transport.read_timeout() + RESEND_MARGIN,
        ));
        let flusher_task = buffer.is_durable().then(|| flusher.spawn(&handle));

        tracing::info!(
            dsn = %dsn,
            max_queue_size = config.transport.max_queue_size,
            buffer_durable = buffer.is_durable(),
            "Pipeline started"
        );

        Ok(Pipeline {
            config,
            active: Some(Active {
                dsn,
                handle,
                recorder,
                transport,
                buffer,
                flusher,
                flusher_task: Mutex::new(flusher_task),
            }),
            runtime: Mutex::new(runtime),
            closed: AtomicBool::new(false),
            warned_disabled: AtomicBool::new(false),
        })
    }
}

struct Active {
    dsn: Dsn,
    handle: Handle,
    recorder: Arc<ClientReportRecorder>,
    transport: Arc<Transport>,
    buffer: Arc<dyn EnvelopeBuffer>,
    flusher: Arc<BufferFlusher>,
    flusher_task: Mutex<Option<JoinHandle<()>>>,
}

/// Composition root of the delivery path.
///
/// A pipeline built from an invalid configuration is disabled: it accepts
/// [`Pipeline::capture`] calls and drops the envelopes.
pub struct Pipeline {
    config: Config,
    active: Option<Active>,
    runtime: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    warned_disabled: AtomicBool,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Build a pipeline with its own runtime; disabled on invalid configuration
    pub fn new(config: Config) -> Self {
        Self::or_disabled(Self::builder(config.clone()).build(), config)
    }

    /// Build a pipeline on an existing runtime; disabled on invalid configuration
    pub fn with_handle(config: Config, handle: Handle) -> Self {
        Self::or_disabled(Self::builder(config.clone()).handle(handle).build(), config)
    }

    /// Build a pipeline with its own runtime, returning configuration errors
    pub fn try_new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// A pipeline that drops everything
    pub fn disabled(config: Config) -> Self {
        Self {
            config,
            active: None,
            runtime: Mutex::new(None),
            closed: AtomicBool::new(false),
            warned_disabled: AtomicBool::new(false),
        }
    }

    fn or_disabled(result: Result<Self>, config: Config) -> Self {
        match result {
            Ok(pipeline) => pipeline,
            Err(e) => {
                tracing::warn!(error = %e, "Pipeline disabled");
                Self::disabled(config)
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Effective configuration, DSN options applied
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dsn(&self) -> Option<&Dsn> {
        self.active.as_ref().map(|a| &a.dsn)
    }

    pub fn transport(&self) -> Option<&Arc<Transport>> {
        self.active.as_ref().map(|a| &a.transport)
    }

    pub fn buffer(&self) -> Option<&Arc<dyn EnvelopeBuffer>> {
        self.active.as_ref().map(|a| &a.buffer)
    }

    pub fn recorder(&self) -> Option<&Arc<ClientReportRecorder>> {
        self.active.as_ref().map(|a| &a.recorder)
    }

    /// Runtime the pipeline spawns onto
    pub fn handle(&self) -> Option<&Handle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    /// False while rate limited or after a recent queue overflow
    pub fn is_healthy(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.transport.is_healthy())
    }

    /// Hand an envelope to the transport without blocking.
    ///
    /// Returns whether it was accepted; rejections are already accounted.
    /// With a durable buffer failed sends are stored for a later resend.
    pub fn capture(&self, envelope: Envelope, mut hint: Hint) -> bool {
        let Some(active) = &self.active else {
            if !self.warned_disabled.swap(true, Ordering::Relaxed) {
                tracing::warn!("Pipeline disabled, dropping captured envelopes");
            }
            return false;
        };

        if active.buffer.is_durable() {
            hint.set_retryable(true);
        }
        match active.transport.enqueue(envelope, hint) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Envelope not accepted");
                false
            }
        }
    }

    /// Send pending client report counts, then wait for outstanding
    /// requests. Returns true if the queue drained within `timeout`.
    ///
    /// Blocking; use [`Pipeline::flush_async`] on the runtime.
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        active.send_pending_report();
        active.transport.flush(timeout)
    }

    pub async fn flush_async(&self, timeout: Duration) -> bool {
        let Some(active) = &self.active else {
            return true;
        };
        active.send_pending_report();
        active.transport.flush_async(timeout).await
    }

    /// Ask the flusher to resend buffered envelopes now
    pub fn flush_buffer(&self) {
        if let Some(active) = &self.active {
            active.flusher.signal();
        }
    }

    /// Run one buffer flush cycle and report what happened
    pub async fn drain_buffer(&self) -> FlushSummary {
        match &self.active {
            Some(active) => active.flusher.flush_once().await,
            None => FlushSummary::default(),
        }
    }

    /// Report a network state change from the host.
    ///
    /// Becoming connected triggers a buffer flush.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        let Some(active) = &self.active else {
            return;
        };
        let previous = active.transport.set_connectivity(connectivity);
        if connectivity == Connectivity::Connected && previous != Connectivity::Connected {
            active.flusher.signal();
        }
    }

    /// Stop the flusher, close the transport within the shutdown grace
    /// window and shut down an owned runtime. Idempotent.
    ///
    /// Blocking; with an owned runtime it must be called outside of it.
    /// Pipelines on a borrowed runtime may use [`Pipeline::close_async`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(active) = &self.active {
            active.stop_flusher();
            active.transport.close(false);
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(self.config.transport.shutdown_timeout());
        }
        tracing::info!("Pipeline closed");
    }

    pub async fn close_async(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(active) = &self.active {
            active.stop_flusher();
            active.transport.close_async(false).await;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::info!("Pipeline closed");
    }
}

impl Active {
    fn send_pending_report(&self) {
        if let Some(report) = self.recorder.take_report_envelope() {
            tracing::debug!("Sending pending client report");
            if let Err(e) = self.transport.enqueue(report, Hint::new()) {
                tracing::debug!(error = %e, "Client report not sent, counts kept for the next send");
            }
        }
    }

    fn stop_flusher(&self) {
        self.flusher.cancel();
        if let Some(task) = self.flusher_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(active) = &self.active {
            active.stop_flusher();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}
