//! Thread and stack frame model
//!
//! A [`DebugThread`] is kept alive across `threads` refreshes as long as the
//! adapter keeps reporting its id, so listeners attached to it survive.
//! Frames are resolved lazily and dropped whenever new stop details arrive.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::common::emitter::lock;
use crate::common::{Emitter, Result, Subscription};
use crate::dap::connection::DapConnection;
use crate::dap::{
    Scope, ScopesArguments, ScopesResponseBody, StackFrame, StackTraceArguments,
    StackTraceResponseBody, StoppedEventBody, Thread, ThreadArguments,
};

/// Metadata of the `stopped` event that last affected a thread
pub type StoppedDetails = StoppedEventBody;

/// Execution state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stopped,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct ThreadInner {
    raw: Thread,
    stopped_details: Option<StoppedDetails>,
    /// Bumped whenever the stop details change; stale frame fetches are discarded
    generation: u64,
    /// Generation for which frames were last requested
    frames_requested: Option<u64>,
    frames: Vec<Arc<DebugStackFrame>>,
    current_frame: Option<Arc<DebugStackFrame>>,
}

/// A thread of the debuggee
pub struct DebugThread {
    id: i64,
    connection: Arc<DapConnection>,
    inner: Mutex<ThreadInner>,
    did_change: Emitter<i64>,
}

impl DebugThread {
    pub fn new(raw: Thread, connection: Arc<DapConnection>) -> Arc<Self> {
        Arc::new(Self {
            id: raw.id,
            connection,
            inner: Mutex::new(ThreadInner {
                raw,
                stopped_details: None,
                generation: 0,
                frames_requested: None,
                frames: Vec::new(),
                current_frame: None,
            }),
            did_change: Emitter::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> String {
        lock(&self.inner).raw.name.clone()
    }

    pub fn raw(&self) -> Thread {
        lock(&self.inner).raw.clone()
    }

    pub fn state(&self) -> ThreadState {
        if lock(&self.inner).stopped_details.is_some() {
            ThreadState::Stopped
        } else {
            ThreadState::Running
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ThreadState::Stopped
    }

    pub fn stopped_details(&self) -> Option<StoppedDetails> {
        lock(&self.inner).stopped_details.clone()
    }

    pub fn frames(&self) -> Vec<Arc<DebugStackFrame>> {
        lock(&self.inner).frames.clone()
    }

    pub fn current_frame(&self) -> Option<Arc<DebugStackFrame>> {
        lock(&self.inner).current_frame.clone()
    }

    /// Select one of the resolved frames; returns false if no frame has that id
    pub fn set_current_frame(&self, frame_id: i64) -> bool {
        let found = {
            let mut inner = lock(&self.inner);
            let frame = inner.frames.iter().find(|f| f.id() == frame_id).cloned();
            match frame {
                Some(frame) => {
                    inner.current_frame = Some(frame);
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify_change();
        }
        found
    }

    /// Listen for changes to this thread's state or frames
    pub fn on_did_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&i64) + Send + Sync + 'static,
    {
        self.did_change.subscribe(listener)
    }

    pub(crate) fn notify_change(&self) {
        self.did_change.fire(&self.id);
    }

    /// Replace the raw descriptor after a refresh
    pub(crate) fn update_raw(&self, raw: Thread) {
        lock(&self.inner).raw = raw;
    }

    /// Record new stop details and invalidate the frame cache
    pub(crate) fn set_stopped_details(&self, details: StoppedDetails) {
        let mut inner = lock(&self.inner);
        inner.stopped_details = Some(details);
        inner.generation += 1;
        inner.frames.clear();
        inner.current_frame = None;
    }

    /// Mark the thread as running, dropping its stop details and frames
    pub(crate) fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.stopped_details = None;
        inner.generation += 1;
        inner.frames.clear();
        inner.current_frame = None;
    }

    /// Claim the frame fetch for the current stop; false if already claimed
    pub(crate) fn claim_frames_fetch(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.stopped_details.is_none() || inner.frames_requested == Some(inner.generation) {
            return false;
        }
        inner.frames_requested = Some(inner.generation);
        true
    }

    /// Request the top `levels` frames and make the top frame current
    pub async fn fetch_frames(&self, levels: i64) -> Result<Vec<Arc<DebugStackFrame>>> {
        self.load_frames(levels).await.map(|(frames, _)| frames)
    }

    /// Like [`fetch_frames`](Self::fetch_frames), also reporting whether the
    /// result was stored. If the stop details change while the request is in
    /// flight, the frames belong to an old stop and the cache is left alone.
    #[tracing::instrument(skip(self), fields(thread = self.id))]
    pub(crate) async fn load_frames(&self, levels: i64) -> Result<(Vec<Arc<DebugStackFrame>>, bool)> {
        let generation = lock(&self.inner).generation;
        let args = StackTraceArguments {
            thread_id: self.id,
            start_frame: Some(0),
            levels: Some(levels),
        };
        let body: StackTraceResponseBody = self
            .connection
            .request("stackTrace", Some(serde_json::to_value(args)?))
            .await?;

        let frames: Vec<Arc<DebugStackFrame>> = body
            .stack_frames
            .into_iter()
            .map(|raw| Arc::new(DebugStackFrame::new(self.id, raw, self.connection.clone())))
            .collect();

        {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                tracing::debug!("Discarding frames from a previous stop");
                return Ok((frames, false));
            }
            inner.current_frame = frames.first().cloned();
            inner.frames = frames.clone();
        }
        tracing::debug!(count = frames.len(), "Resolved stack frames");
        self.notify_change();
        Ok((frames, true))
    }

    pub async fn pause(&self) -> Result<()> {
        self.thread_request("pause").await
    }

    pub async fn continue_(&self) -> Result<()> {
        self.thread_request("continue").await
    }

    pub async fn next(&self) -> Result<()> {
        self.thread_request("next").await
    }

    pub async fn step_in(&self) -> Result<()> {
        self.thread_request("stepIn").await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.thread_request("stepOut").await
    }

    async fn thread_request(&self, command: &str) -> Result<()> {
        let args = serde_json::to_value(ThreadArguments { thread_id: self.id })?;
        self.connection.send_request(command, Some(args)).await?;
        Ok(())
    }
}

impl fmt::Debug for DebugThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("DebugThread")
            .field("id", &self.id)
            .field("name", &inner.raw.name)
            .field("stopped", &inner.stopped_details.is_some())
            .field("frames", &inner.frames.len())
            .finish()
    }
}

/// A resolved stack frame
pub struct DebugStackFrame {
    thread_id: i64,
    raw: StackFrame,
    connection: Arc<DapConnection>,
}

impl DebugStackFrame {
    pub fn new(thread_id: i64, raw: StackFrame, connection: Arc<DapConnection>) -> Self {
        Self {
            thread_id,
            raw,
            connection,
        }
    }

    pub fn id(&self) -> i64 {
        self.raw.id
    }

    pub fn thread_id(&self) -> i64 {
        self.thread_id
    }

    pub fn raw(&self) -> &StackFrame {
        &self.raw
    }

    /// Request the scopes of this frame (never cached)
    pub async fn scopes(&self) -> Result<Vec<Scope>> {
        let args = ScopesArguments { frame_id: self.raw.id };
        let body: ScopesResponseBody = self
            .connection
            .request("scopes", Some(serde_json::to_value(args)?))
            .await?;
        Ok(body.scopes)
    }
}

impl fmt::Debug for DebugStackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugStackFrame")
            .field("thread_id", &self.thread_id)
            .field("raw", &self.raw)
            .finish()
    }
}
