//! Session management
//!
//! A session runs one guest against one terminal surface. The guest executes
//! on its own worker thread and reports output and termination over a
//! channel; the owner calls [`Session::pump`] to move output into the
//! surface, loop engine replies back into the guest's input and paint.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use wasmi::Engine;

use super::guest::{GuestError, GuestInstance, GuestModule, GuestOutcome};
use super::runtime::Runtime;
use super::vt::{ViewportSnapshot, VtEngine, VtError, VtTerminal, WasmEngine};
use super::wasi::{CancelToken, InputHandle, WasiBridge};
use crate::config::{FitMode, ResolvedOptions, Size};
use crate::ui::canvas::{Canvas, FontSpec};
use crate::ui::renderer::Renderer;
use crate::ui::scheduler::DEFAULT_FRAME_INTERVAL;
use crate::ui::surface::{Frame, SurfaceOptions, TerminalSurface};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Guest(#[from] GuestError),

    #[error(transparent)]
    Vt(#[from] VtError),

    #[error("Failed to spawn guest worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Session already started")]
    AlreadyStarted,
}

/// Session lifecycle as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Loading,
    Running,
    Exited(i32),
    Error(String),
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Error(_))
    }
}

/// Worker to host messages
#[derive(Debug)]
enum GuestEvent {
    Output(Vec<u8>),
    Finished(GuestOutcome),
}

type StatusListener = Box<dyn FnMut(&SessionStatus)>;

/// Where the surface is shown
#[derive(Debug, Clone, Copy)]
pub struct HostArea {
    /// Device pixel ratio
    pub scale: f32,
    /// Available area in logical pixels, used with container fit
    pub pixels: Option<(u32, u32)>,
    pub frame_interval: Duration,
}

impl Default for HostArea {
    fn default() -> Self {
        Self {
            scale: 1.0,
            pixels: None,
            frame_interval: DEFAULT_FRAME_INTERVAL,
        }
    }
}

pub struct Session<E: VtEngine, C: Canvas> {
    status: SessionStatus,
    listeners: Vec<StatusListener>,
    surface: Option<TerminalSurface<E, C>>,
    input: InputHandle,
    interactive: bool,
    cancel: CancelToken,
    events: Option<Receiver<GuestEvent>>,
    worker: Option<JoinHandle<()>>,
    disposed: bool,
}

impl<E: VtEngine, C: Canvas> Session<E, C> {
    pub fn new(interactive: bool, input_limit: usize) -> Self {
        Self {
            status: SessionStatus::Loading,
            listeners: Vec::new(),
            surface: None,
            input: InputHandle::new(input_limit),
            interactive,
            cancel: CancelToken::new(),
            events: None,
            worker: None,
            disposed: false,
        }
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Called on every status transition
    pub fn on_status(&mut self, listener: impl FnMut(&SessionStatus) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status == status {
            return;
        }
        match &status {
            SessionStatus::Error(message) => error!("Session error: {}", message),
            other => info!("Session status: {:?}", other),
        }
        self.status = status;
        for listener in &mut self.listeners {
            listener(&self.status);
        }
    }

    /// Forwarder for raw input bytes; only interactive sessions hand one out
    pub fn input_handle(&self) -> Option<InputHandle> {
        self.interactive.then(|| self.input.clone())
    }

    pub fn queued_input(&self) -> usize {
        self.input.queued_bytes()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn surface(&self) -> Option<&TerminalSurface<E, C>> {
        self.surface.as_ref()
    }

    pub fn size(&self) -> Option<Size> {
        self.surface.as_ref().map(|s| s.size())
    }

    /// Record a failure that happened before the guest could run
    pub fn fail(&mut self, err: &SessionError) {
        self.set_status(SessionStatus::Error(err.to_string()));
    }

    /// Instantiate the guest here, then run it on a worker thread
    pub fn launch(
        &mut self,
        engine: &Engine,
        module: &GuestModule,
        surface: TerminalSurface<E, C>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> Result<(), SessionError> {
        if self.surface.is_some() || self.disposed {
            return Err(SessionError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel();
        let stdout_tx = tx.clone();
        let stderr_tx = tx.clone();
        let bridge = WasiBridge::new(args, env, self.input.clone())
            .with_stdout(move |data| {
                let _ = stdout_tx.send(GuestEvent::Output(data.to_vec()));
            })
            .with_stderr(move |data| {
                let _ = stderr_tx.send(GuestEvent::Output(data.to_vec()));
            })
            .with_exit_hook(|code| debug!("Guest called proc_exit({})", code))
            .with_cancel(self.cancel.clone());

        let guest = GuestInstance::instantiate(engine, module, bridge)?;
        let worker = thread::Builder::new()
            .name("guest".to_string())
            .spawn(move || {
                let outcome = guest.run();
                let _ = tx.send(GuestEvent::Finished(outcome));
            })
            .map_err(SessionError::Spawn)?;

        self.surface = Some(surface);
        self.events = Some(rx);
        self.worker = Some(worker);
        self.set_status(SessionStatus::Running);
        Ok(())
    }

    /// Move guest output into the surface, loop engine replies back into the
    /// guest's input, apply termination and tick the frame scheduler.
    pub fn pump(&mut self) -> Result<Frame, SessionError> {
        self.pump_at(Instant::now())
    }

    pub fn pump_at(&mut self, now: Instant) -> Result<Frame, SessionError> {
        let Some(surface) = self.surface.as_mut() else {
            return Ok(Frame::Skipped);
        };

        let mut finished = None;
        let mut lost_worker = false;
        if let Some(events) = &self.events {
            loop {
                match events.try_recv() {
                    Ok(GuestEvent::Output(data)) => surface.write(&data)?,
                    Ok(GuestEvent::Finished(outcome)) => finished = Some(outcome),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        lost_worker = finished.is_none();
                        break;
                    }
                }
            }
        }

        for response in surface.drain_responses()? {
            if let Err(e) = self.input.push(&response) {
                warn!("Dropped engine reply: {}", e);
            }
        }
        let frame = surface.tick_at(now)?;

        if let Some(outcome) = finished {
            self.events = None;
            self.join_worker();
            match outcome {
                GuestOutcome::Exited(code) => self.set_status(SessionStatus::Exited(code)),
                GuestOutcome::Trapped(message) => self.set_status(SessionStatus::Error(message)),
                GuestOutcome::Cancelled => debug!("Guest cancelled"),
            }
        } else if lost_worker {
            self.events = None;
            self.join_worker();
            self.set_status(SessionStatus::Error("guest worker stopped unexpectedly".to_string()));
        }
        Ok(frame)
    }

    /// Pump until the guest finishes or `timeout` elapses, then paint a
    /// final frame. Returns the last painted snapshot.
    pub fn wait(&mut self, timeout: Duration) -> Result<Option<ViewportSnapshot>, SessionError> {
        let deadline = Instant::now() + timeout;
        let mut last = None;
        loop {
            if let Frame::Painted(snapshot) = self.pump()? {
                last = Some(snapshot);
            }
            if self.status.is_finished() || self.events.is_none() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        if let Some(surface) = self.surface.as_mut() {
            surface.request_frame();
            if let Frame::Painted(snapshot) = surface.tick_at(Instant::now() + Duration::from_secs(1))? {
                last = Some(snapshot);
            }
        }
        Ok(last)
    }

    pub fn resize(&mut self, size: Size) -> Result<(), SessionError> {
        if let Some(surface) = self.surface.as_mut() {
            surface.resize(size)?;
        }
        Ok(())
    }

    pub fn fit(&mut self, width_px: u32, height_px: u32) -> Result<Option<Size>, SessionError> {
        match self.surface.as_mut() {
            Some(surface) => Ok(Some(surface.fit(width_px, height_px)?)),
            None => Ok(None),
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                if worker.join().is_err() {
                    warn!("Guest worker panicked");
                }
            } else {
                // still inside guest code that makes no syscalls
                debug!("Detaching guest worker");
            }
        }
    }

    /// Cancel the guest and release the surface. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.cancel.cancel();
        if let Some(mut surface) = self.surface.take() {
            if let Err(e) = surface.dispose() {
                warn!("Failed to release terminal surface: {}", e);
            }
        }
        self.events = None;
        self.join_worker();
        debug!("Session disposed");
    }
}

impl<C: Canvas> Session<WasmEngine, C> {
    /// Load everything the options name and launch the guest.
    ///
    /// Failures land in the status as `Error` as well as being returned.
    /// If the session is cancelled while loading, nothing is started.
    pub fn start(
        &mut self,
        runtime: &Runtime,
        options: &ResolvedOptions,
        canvas: C,
        host: HostArea,
    ) -> Result<(), SessionError> {
        // A second start must leave the running session's status alone
        if self.surface.is_some() || self.disposed {
            return Err(SessionError::AlreadyStarted);
        }
        let result = self.try_start(runtime, options, canvas, host);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    fn try_start(
        &mut self,
        runtime: &Runtime,
        options: &ResolvedOptions,
        canvas: C,
        host: HostArea,
    ) -> Result<(), SessionError> {
        let module = runtime.load_guest(&options.wasm)?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        let artifact = runtime.load_vt(&options.terminal.engine)?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let font = FontSpec::new(options.terminal.font_size, options.terminal.font_family.clone());
        let renderer = Renderer::new(
            canvas,
            font,
            options.terminal.theme.clone(),
            host.scale,
            runtime.metrics(),
        );
        let size = match (options.fit, host.pixels) {
            (FitMode::Container, Some((w, h))) => renderer.grid_for(w, h),
            _ => options.size,
        };
        let terminal = VtTerminal::create(
            artifact.instantiate()?,
            size.cols,
            size.rows,
            &options.terminal.theme,
        )?;
        let surface = TerminalSurface::new(
            terminal,
            renderer,
            SurfaceOptions {
                convert_eol: options.terminal.convert_eol,
                show_cursor: options.show_cursor(),
                frame_interval: host.frame_interval,
            },
        )?;

        let mut args = vec![options.wasm.clone()];
        args.extend(options.argv.build(size));
        info!("Launching {} at {}x{}", options.wasm, size.cols, size.rows);
        self.launch(runtime.engine(), &module, surface, args, options.env.clone())
    }
}

impl<E: VtEngine, C: Canvas> Drop for Session<E, C> {
    fn drop(&mut self) {
        self.dispose();
    }
}
