// ABOUTME: Notebook and cell model for stateful code execution with typed outputs
// Cells move Idle -> Running -> {Completed, Error, TimedOut}; never backwards

pub mod executor;
pub mod export;
pub mod store;

pub use executor::CellExecutor;
pub use store::NotebookStore;

use crate::sandbox::SandboxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotebookError {
    #[error("invalid cell state transition from {from:?} to {to:?}")]
    InvalidTransition { from: CellState, to: CellState },

    #[error("no cell at index {0}")]
    NoSuchCell(usize),

    #[error("failed to persist notebook: {0}")]
    Storage(#[from] std::io::Error),

    #[error("notebook file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Which stream a text output belongs to. `Result` is the value of a trailing
/// bare expression, the interactive-shell convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Result,
}

/// Typed output attached to a cell. Image payloads stay on disk under the
/// workspace; the output carries a workspace-relative path, never the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    Text {
        text: String,
        stream: StreamKind,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    Image {
        path: String,
        mime: String,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
        truncated: bool,
    },
    Markup {
        html: String,
    },
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Text {
            text: text.into(),
            stream: StreamKind::Stdout,
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Output::Text {
            text: text.into(),
            stream: StreamKind::Stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    Idle,
    Running,
    Completed,
    Error,
    TimedOut,
}

impl CellState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CellState::Completed | CellState::Error | CellState::TimedOut
        )
    }

    fn can_transition_to(self, next: CellState) -> bool {
        matches!(
            (self, next),
            (CellState::Idle, CellState::Running)
                | (CellState::Running, CellState::Completed)
                | (CellState::Running, CellState::Error)
                | (CellState::Running, CellState::TimedOut)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub index: usize,
    pub source: String,
    pub state: CellState,
    pub outputs: Vec<Output>,
    pub execution_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Cell {
    pub fn new(index: usize, source: impl Into<String>) -> Self {
        Self {
            index,
            source: source.into(),
            state: CellState::Idle,
            outputs: Vec::new(),
            execution_count: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: CellState) -> Result<(), NotebookError> {
        if !self.state.can_transition_to(to) {
            return Err(NotebookError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), NotebookError> {
        self.transition(CellState::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Closes the cell in a terminal state with its outputs.
    pub fn finish(
        &mut self,
        state: CellState,
        outputs: Vec<Output>,
        execution_count: Option<u32>,
    ) -> Result<(), NotebookError> {
        if !state.is_terminal() {
            return Err(NotebookError::InvalidTransition {
                from: self.state,
                to: state,
            });
        }
        self.transition(state)?;
        self.outputs = outputs;
        self.execution_count = execution_count;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

/// All cells of a session plus the accumulated declaration set replayed
/// before every cell (imports, function and class definitions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notebook {
    pub cells: Vec<Cell>,
    #[serde(default)]
    pub declarations: Vec<String>,
    #[serde(default)]
    pub execution_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}

impl Notebook {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            cells: Vec::new(),
            declarations: Vec::new(),
            execution_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn append_cell(&mut self, source: impl Into<String>) -> usize {
        let index = self.cells.len();
        self.cells.push(Cell::new(index, source));
        self.touched();
        index
    }

    pub fn cell(&self, index: usize) -> Result<&Cell, NotebookError> {
        self.cells.get(index).ok_or(NotebookError::NoSuchCell(index))
    }

    pub fn cell_mut(&mut self, index: usize) -> Result<&mut Cell, NotebookError> {
        self.touched();
        self.cells
            .get_mut(index)
            .ok_or(NotebookError::NoSuchCell(index))
    }

    /// Appends newly observed declarations, keeping first-seen order and
    /// dropping exact duplicates so replay stays idempotent.
    pub fn record_declarations(&mut self, decls: impl IntoIterator<Item = String>) {
        for decl in decls {
            let trimmed = decl.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !self.declarations.iter().any(|d| d == trimmed) {
                self.declarations.push(trimmed.to_string());
            }
        }
        self.touched();
    }

    pub fn next_execution_count(&mut self) -> u32 {
        self.execution_count += 1;
        self.touched();
        self.execution_count
    }

    fn touched(&mut self) {
        self.updated_at = Utc::now();
    }
}
