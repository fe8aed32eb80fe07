//! The fixture stack: a nestable, cross-tier fixture lifecycle with dirty
//! tracking and reset semantics.

use std::collections::BTreeMap;

use tokio::sync::Mutex;

use crate::error::FixtureError;
use crate::timing::Stage;

/// A frame's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Just pushed, setup not yet attempted.
    New,
    /// Setup is in progress.
    SettingUp,
    /// Setup succeeded and the fixture is clean.
    Green,
    /// A dependent left the fixture in a modified state; reset is needed
    /// before further use.
    Dirty,
    /// Setup or reset failed; the frame cannot be used until popped.
    Red,
    /// Popped; no longer part of the stack.
    Done,
}

/// One entry in the fixture stack.
#[derive(Debug, Clone)]
pub struct FixtureFrame {
    /// The fixture's declared name.
    pub name: String,
    /// Current lifecycle state.
    pub state: FrameState,
    /// Errors recorded during this frame's setup, attributed to skipped
    /// dependents if the frame ends up `Red`.
    pub setup_errors: Vec<String>,
    /// The still-open (or closed) timing stage for this frame's setup.
    pub setup_stage: Stage,
}

impl FixtureFrame {
    fn new(name: impl Into<String>, setup_stage: Stage) -> Self {
        Self {
            name: name.into(),
            state: FrameState::New,
            setup_errors: Vec::new(),
            setup_stage,
        }
    }

    /// Whether dependents may run against this frame.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(self.state, FrameState::Green | FrameState::Dirty)
    }
}

/// Manages the live stack of fixtures for a single runner/bundle context.
#[derive(Debug, Default)]
pub struct FixtureStack {
    frames: Mutex<Vec<FixtureFrame>>,
}

impl FixtureStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
        }
    }

    /// Pushes a new frame in the `New` state and immediately transitions it
    /// to `SettingUp`, opening a timing stage named after the fixture under
    /// `parent_stage`.
    pub async fn push(&self, name: impl Into<String>, parent_stage: &Stage) -> FixtureFrame {
        let name = name.into();
        let setup_stage = parent_stage.start_child(format!("setup:{name}"));
        let mut frame = FixtureFrame::new(name, setup_stage);
        frame.state = FrameState::SettingUp;
        self.frames.lock().await.push(frame.clone());
        frame
    }

    /// Records the outcome of the top frame's setup.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::StackEmpty`] if there is no top frame.
    pub async fn complete_setup(&self, error: Option<String>) -> Result<(), FixtureError> {
        let mut frames = self.frames.lock().await;
        let frame = frames.last_mut().ok_or(FixtureError::StackEmpty)?;
        frame.setup_stage.end();
        match error {
            None => frame.state = FrameState::Green,
            Some(reason) => {
                frame.setup_errors.push(reason);
                frame.state = FrameState::Red;
            }
        }
        Ok(())
    }

    /// Marks the top frame dirty.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::StackEmpty`] if the stack is empty.
    pub async fn set_dirty(&self) -> Result<(), FixtureError> {
        let mut frames = self.frames.lock().await;
        let frame = frames.last_mut().ok_or(FixtureError::StackEmpty)?;
        if frame.state == FrameState::Green {
            frame.state = FrameState::Dirty;
        }
        Ok(())
    }

    /// Resets the top frame (clearing `Dirty` back to `Green`, or
    /// transitioning to `Red` on failure).
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::StackEmpty`] if the stack is empty, or
    /// propagates `reset_error` as [`FixtureError::ResetFailed`].
    pub async fn reset(&self, reset_error: Option<String>) -> Result<(), FixtureError> {
        let mut frames = self.frames.lock().await;
        let frame = frames.last_mut().ok_or(FixtureError::StackEmpty)?;
        match reset_error {
            None => {
                if frame.state == FrameState::Dirty {
                    frame.state = FrameState::Green;
                }
                Ok(())
            }
            Some(reason) => {
                frame.state = FrameState::Red;
                Err(FixtureError::ResetFailed {
                    name: frame.name.clone(),
                    reason,
                })
            }
        }
    }

    /// Returns the status of the top frame: usable for dependents, or a
    /// skip reason built from its setup errors.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::StackEmpty`] if the stack is empty.
    pub async fn status(&self) -> Result<Result<(), String>, FixtureError> {
        let frames = self.frames.lock().await;
        let frame = frames.last().ok_or(FixtureError::StackEmpty)?;
        if frame.is_usable() {
            Ok(Ok(()))
        } else {
            let reason = if frame.setup_errors.is_empty() {
                format!("fixture '{}' is not usable", frame.name)
            } else {
                format!(
                    "fixture failed to set up: {}",
                    frame.setup_errors.join("; ")
                )
            };
            Ok(Err(reason))
        }
    }

    /// Pops the top frame, transitioning it to `Done`.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::StackEmpty`] if the stack is empty, or
    /// [`FixtureError::NotTopFrame`] if `name` does not match the top frame.
    pub async fn pop(&self, name: &str) -> Result<FixtureFrame, FixtureError> {
        let mut frames = self.frames.lock().await;
        let top = frames.last().ok_or(FixtureError::StackEmpty)?;
        if top.name != name {
            return Err(FixtureError::NotTopFrame {
                name: name.to_owned(),
            });
        }
        let mut frame = frames.pop().ok_or(FixtureError::StackEmpty)?;
        frame.state = FrameState::Done;
        Ok(frame)
    }

    /// The number of live (non-`Done`) frames currently on the stack.
    pub async fn depth(&self) -> usize {
        self.frames.lock().await.len()
    }
}

/// Forwards bundle-originated `StackOperation` requests to the fixture
/// ticket they target, when that fixture lives in a different tier
/// (another bundle).
///
/// Tickets are opaque request identifiers handed out by [`FixtureStack::push`]
/// consumers; the registry here only tracks which bundle owns which ticket
/// so a `Pop` with no matching `Push` can be rejected outright.
#[derive(Debug, Default)]
pub struct TicketRegistry {
    owners: Mutex<BTreeMap<String, String>>,
}

impl TicketRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `ticket` is owned by `bundle_id`, from a `Push`.
    pub async fn record_push(&self, ticket: impl Into<String>, bundle_id: impl Into<String>) {
        self.owners.lock().await.insert(ticket.into(), bundle_id.into());
    }

    /// Resolves and removes `ticket`'s owner, from a `Pop`.
    ///
    /// # Errors
    ///
    /// Returns [`FixtureError::NotTopFrame`]-shaped error via
    /// [`crate::error::BundleError::UnknownTicket`] semantics at the
    /// caller; here we simply report absence.
    pub async fn take_owner(&self, ticket: &str) -> Option<String> {
        self.owners.lock().await.remove(ticket)
    }
}
