//! Server lifecycle: bind once, accept, one thread per connection.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::events::{EventHub, ServerEvent};
use crate::exchange::{self, ExchangeContext, ExchangeOutcome};
use crate::framer::Framer;
use crate::reader::ChannelReader;
use crate::registry::{ActionOrder, ActionRegistry, RegistryError, RouteRegistry};
use crate::route::{AfterAction, BeforeAction, ErrorHandler, PatternError, Route};
use crate::timeout::TimerService;
use crate::writer::ChannelWriter;

// Lifecycle states. A server starts at most once and stops at most once.
const CREATED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

struct ServerInner {
    config: Config,
    routes: RouteRegistry,
    befores: ActionRegistry<dyn BeforeAction>,
    afters: ActionRegistry<dyn AfterAction>,
    error_handlers: RwLock<Vec<Arc<dyn ErrorHandler>>>,
    events: EventHub,
    timer: TimerService,
    state: AtomicU8,
    stopping: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    started_at: Mutex<Option<SystemTime>>,
    active: AtomicUsize,
    next_conn_id: AtomicUsize,
    conns: Mutex<HashMap<usize, TcpStream>>,
}

/// An embeddable blocking HTTP/1.1 server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn create(config: Config) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config,
                routes: RouteRegistry::new(),
                befores: ActionRegistry::new(ActionOrder::Before),
                afters: ActionRegistry::new(ActionOrder::After),
                error_handlers: RwLock::new(Vec::new()),
                events: EventHub::new(),
                timer: TimerService::new(),
                state: AtomicU8::new(CREATED),
                stopping: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                started_at: Mutex::new(None),
                active: AtomicUsize::new(0),
                next_conn_id: AtomicUsize::new(0),
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn add_route(&self, route: Route) -> Result<(), RegistryError> {
        self.inner.routes.add(route)
    }

    pub fn remove_route(&self, pattern: &str) -> Result<bool, PatternError> {
        Ok(self.inner.routes.remove(pattern)?.is_some())
    }

    pub fn before(
        &self,
        pattern: &str,
        action: impl BeforeAction + 'static,
    ) -> Result<(), PatternError> {
        self.inner.befores.add(pattern, Arc::new(action))
    }

    pub fn after(
        &self,
        pattern: &str,
        action: impl AfterAction + 'static,
    ) -> Result<(), PatternError> {
        self.inner.afters.add(pattern, Arc::new(action))
    }

    pub fn add_error_handler(&self, handler: impl ErrorHandler + 'static) {
        self.inner.error_handlers.write().push(Arc::new(handler));
    }

    pub fn on_event(&self, observer: impl Fn(&ServerEvent) + Send + Sync + 'static) {
        self.inner.events.subscribe(observer);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Bind and serve on the calling thread until the server is stopped.
    ///
    /// Fails if the server was started before.
    pub fn start(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = self.bind(addr)?;
        self.accept_loop(listener);
        Ok(())
    }

    /// Bind, then serve on a background thread. Returns the bound address.
    pub fn start_in_background(&self, addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
        let listener = self.bind(addr)?;
        let bound = listener.local_addr()?;
        let server = self.clone();
        thread::Builder::new()
            .name("mazurka-accept".into())
            .spawn(move || server.accept_loop(listener))?;
        Ok(bound)
    }

    fn bind(&self, addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
        if self
            .inner
            .state
            .compare_exchange(CREATED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(io::Error::other("server can only be started once"));
        }
        let listener = TcpListener::bind(addr)?;
        let bound = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(bound);
        let started = SystemTime::now();
        *self.inner.started_at.lock() = Some(started);
        info!(%bound, "server started");
        self.inner
            .events
            .dispatch(&ServerEvent::HttpServerStarted { started_at: started });
        Ok(listener)
    }

    fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.inner.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    let _ = stream.set_nodelay(true);
                    self.spawn_connection(stream, peer);
                }
                Err(e) => {
                    if self.inner.stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    error!(error = %e, "TCP accept error");
                }
            }
        }
        debug!("accept loop ended");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(clone) = stream.try_clone() {
            self.inner.conns.lock().insert(id, clone);
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let server = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("mazurka-conn-{id}"))
            .spawn(move || {
                if let Err(e) = server.run_connection(&stream) {
                    debug!(%peer, error = %e, "connection setup failed");
                }
                let _ = stream.shutdown(Shutdown::Both);
                server.inner.conns.lock().remove(&id);
                server.inner.active.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn a connection thread");
            self.inner.conns.lock().remove(&id);
            self.inner.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Serve exchanges on one connection until it closes.
    fn run_connection(&self, stream: &TcpStream) -> io::Result<()> {
        let inner = &*self.inner;
        let read_half = stream.try_clone()?;
        let write_half = stream.try_clone()?;
        let cancel_half = stream.try_clone()?;
        let continue_half = stream.try_clone()?;

        let cancel_read: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let _ = cancel_half.shutdown(Shutdown::Read);
        });
        let continue_sink: Arc<dyn Fn(&[u8]) -> io::Result<()> + Send + Sync> =
            Arc::new(move |bytes| (&continue_half).write_all(bytes));

        let mut reader = ChannelReader::new(read_half);
        let mut writer = ChannelWriter::new(
            write_half,
            Framer::new(inner.config.max_unsuccessful_responses),
            inner.config.discard_rejected_informational,
        );
        let error_handlers = inner.error_handlers.read().clone();

        loop {
            let ctx = ExchangeContext {
                config: &inner.config,
                routes: &inner.routes,
                befores: &inner.befores,
                afters: &inner.afters,
                error_handlers: &error_handlers,
                events: &inner.events,
                timer: Some(&inner.timer),
                cancel_read: Some(cancel_read.clone()),
                continue_sink: Some(continue_sink.clone()),
                server_stopping: &inner.stopping,
            };
            let result = exchange::run(&ctx, reader, writer);
            match result.outcome {
                ExchangeOutcome::KeepAlive => {
                    reader = result.reader.new_reader();
                    writer = result.writer.new_writer();
                }
                ExchangeOutcome::Close => return Ok(()),
            }
        }
    }

    /// Graceful stop: no new connections, wait for live ones indefinitely.
    pub fn stop(&self) {
        self.stop_inner(None);
    }

    /// Graceful stop, then force-close whatever is still alive at the
    /// deadline.
    pub fn stop_by(&self, deadline: Instant) {
        self.stop_inner(Some(deadline));
    }

    pub fn stop_within(&self, timeout: Duration) {
        self.stop_inner(Some(Instant::now() + timeout));
    }

    /// Immediate shutdown of every connection.
    pub fn kill(&self) {
        self.stop_inner(Some(Instant::now()));
    }

    fn stop_inner(&self, deadline: Option<Instant>) {
        if self
            .inner
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // never started, or a stop already won the race
            self.inner.state.store(STOPPED, Ordering::SeqCst);
            return;
        }
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.wake_accept_loop();

        loop {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let conns = self.inner.conns.lock();
                warn!(count = conns.len(), "stop deadline hit, closing connections");
                for stream in conns.values() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        // closed sockets unwind their threads promptly
        while self.inner.active.load(Ordering::SeqCst) != 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let started_at = self
            .inner
            .started_at
            .lock()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let stopped_at = SystemTime::now();
        info!("server stopped");
        self.inner.events.dispatch(&ServerEvent::HttpServerStopped {
            stopped_at,
            started_at,
        });
    }

    /// The accept loop parks in `accept`; poke it with a throwaway
    /// connection so it observes the stop flag.
    fn wake_accept_loop(&self) {
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
    }
}
