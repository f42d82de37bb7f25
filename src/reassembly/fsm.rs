//! TCP control-flag state machine.
//!
//! One [`TcpFsm`] is shared by both directions of a flow. It classifies
//! every segment's flags against the current connection state but never
//! blocks reassembly: violations are counted and surfaced as an anomaly
//! marker while the bytes keep flowing to the assembler.
//!
//! Reference: RFC 793 section 3.2 (state diagram), simplified.

use std::fmt;

use super::TcpFlags;

/// Connection state observed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowState {
    #[default]
    Unknown,
    SynSent,
    Established,
    FinWait,
    Closed,
    /// Tracking started without a handshake or lost sync with it.
    Invalid,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowState::Unknown => "unknown",
            FlowState::SynSent => "syn_sent",
            FlowState::Established => "established",
            FlowState::FinWait => "fin_wait",
            FlowState::Closed => "closed",
            FlowState::Invalid => "invalid",
        };
        f.write_str(s)
    }
}

/// Classification of a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Accept,
    Retransmission,
    Violation,
}

impl Validation {
    pub fn is_anomaly(self) -> bool {
        matches!(self, Validation::Violation)
    }
}

/// Snapshot of a flow's validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsmSummary {
    pub state: FlowState,
    pub violations: u64,
    pub retransmissions: u64,
    pub partial: bool,
}

/// Per-flow flag validator.
#[derive(Debug, Clone)]
pub struct TcpFsm {
    state: FlowState,
    partial: bool,
    violations: u64,
    retransmissions: u64,
}

impl TcpFsm {
    pub fn new() -> Self {
        Self {
            state: FlowState::Unknown,
            partial: false,
            violations: 0,
            retransmissions: 0,
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    /// True when the capture started after the client SYN.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    pub fn summary(&self) -> FsmSummary {
        FsmSummary {
            state: self.state,
            violations: self.violations,
            retransmissions: self.retransmissions,
            partial: self.partial,
        }
    }

    /// Classify `flags` and advance the state.
    pub fn validate(&mut self, flags: TcpFlags) -> Validation {
        let (next, verdict) = self.transition(flags);
        if next != self.state {
            tracing::trace!(from = %self.state, to = %next, flags = %flags, "fsm transition");
        }
        self.state = next;
        match verdict {
            Validation::Violation => {
                self.violations += 1;
                tracing::debug!(state = %self.state, flags = %flags, "fsm violation");
            }
            Validation::Retransmission => self.retransmissions += 1,
            Validation::Accept => {}
        }
        verdict
    }

    fn transition(&mut self, flags: TcpFlags) -> (FlowState, Validation) {
        use FlowState::*;
        use Validation::*;

        if flags.rst() {
            return match self.state {
                Closed => (Closed, Retransmission),
                _ => (Closed, Accept),
            };
        }

        let syn_only = flags.syn() && !flags.ack();
        let syn_ack = flags.syn() && flags.ack();

        match self.state {
            Unknown => {
                if syn_only {
                    (SynSent, Accept)
                } else if syn_ack {
                    self.partial = true;
                    (Established, Accept)
                } else {
                    self.partial = true;
                    (Invalid, Violation)
                }
            }
            SynSent => {
                if syn_ack {
                    (Established, Accept)
                } else if syn_only {
                    (SynSent, Retransmission)
                } else {
                    (SynSent, Violation)
                }
            }
            Established => {
                if syn_ack {
                    (Established, Retransmission)
                } else if syn_only {
                    (Established, Violation)
                } else if flags.fin() {
                    (FinWait, Accept)
                } else {
                    (Established, Accept)
                }
            }
            FinWait => {
                if flags.syn() {
                    (FinWait, Violation)
                } else if flags.fin() || flags.ack() {
                    (Closed, Accept)
                } else {
                    (FinWait, Violation)
                }
            }
            Closed => {
                if !flags.syn() && (flags.fin() || flags.ack()) {
                    (Closed, Retransmission)
                } else {
                    (Closed, Violation)
                }
            }
            Invalid => {
                if syn_only {
                    (SynSent, Accept)
                } else if syn_ack {
                    (Established, Accept)
                } else if flags.fin() {
                    (FinWait, Accept)
                } else {
                    (Invalid, Accept)
                }
            }
        }
    }
}

impl Default for TcpFsm {
    fn default() -> Self {
        Self::new()
    }
}
