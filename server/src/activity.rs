//! Activity detector (C3).
//!
//! Consumes raw PTY output bytes and classifies a session as active or idle,
//! extracting an optional application-specific status string along the way.
//! Detection never blocks the output path: [`ActivityDetector::observe`] is a
//! plain synchronous scan, called inline from the session's read-pump before
//! output reaches the title manager and the fan-out stage.

use std::time::Instant;

/// A session is "active" if output was produced within this window.
const ACTIVE_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

/// A recognized marker extracted from output and hidden from downstream
/// consumers. `prefix`/`suffix` bound the text carrying the status string.
struct Recognizer {
    app: &'static str,
    prefix: &'static str,
    suffix: &'static str,
}

/// Known TUI status markers. Extend as new integrations are recognized.
const RECOGNIZERS: &[Recognizer] = &[Recognizer {
    app: "claude",
    prefix: "\u{1b}]9993;",
    suffix: "\u{07}",
}];

/// Current activity classification for a session.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ActivityState {
    pub is_active: bool,
    pub last_activity_at: Option<u64>,
    pub specific_status: Option<SpecificStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpecificStatus {
    pub app: String,
    pub status: String,
}

/// Per-session activity detector. Owns no I/O; pure state fed by the
/// session's read-pump.
pub struct ActivityDetector {
    last_output_at: Option<Instant>,
    specific_status: Option<SpecificStatus>,
    /// Set once [`Self::tick_idle`] has reported the current idle stretch, so
    /// a sweep loop calling it repeatedly only observes one transition.
    idle_notified: bool,
}

/// Outcome of a single [`ActivityDetector::observe`] call.
pub struct Observation {
    /// Bytes with recognized status markers stripped out.
    pub filtered: Vec<u8>,
    /// Set when the active/idle classification flipped on this call.
    pub transitioned: bool,
    pub state: ActivityState,
}

impl Default for ActivityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityDetector {
    pub fn new() -> Self {
        ActivityDetector {
            last_output_at: None,
            specific_status: None,
            idle_notified: false,
        }
    }

    /// Current classification without consuming any bytes.
    pub fn is_active(&self) -> bool {
        self.last_output_at.is_some_and(|t| t.elapsed() <= ACTIVE_WINDOW)
    }

    /// Snapshot the current state without consuming any bytes (used for
    /// `GET /sessions` responses and activity snapshots).
    pub fn current_state(&self, now_epoch_secs: u64) -> ActivityState {
        ActivityState {
            is_active: self.is_active(),
            last_activity_at: self.last_output_at.map(|_| now_epoch_secs),
            specific_status: self.specific_status.clone(),
        }
    }

    /// Feed a chunk of raw output through the detector.
    ///
    /// Strips recognized status markers from the returned bytes and updates
    /// `specific_status` when one is found. Unrecognized bytes (including
    /// invalid UTF-8) pass through unchanged — the scan works on raw bytes.
    pub fn observe(&mut self, data: &[u8], now_epoch_secs: u64) -> Observation {
        let was_active = self.is_active();
        self.last_output_at = Some(Instant::now());
        self.idle_notified = false;

        let mut filtered = Vec::with_capacity(data.len());
        let mut found_status: Option<SpecificStatus> = None;
        let mut rest = data;
        'scan: while !rest.is_empty() {
            for rec in RECOGNIZERS {
                let prefix = rec.prefix.as_bytes();
                if rest.starts_with(prefix) {
                    let after = &rest[prefix.len()..];
                    if let Some(end) = find_subslice(after, rec.suffix.as_bytes()) {
                        let status_bytes = &after[..end];
                        if let Ok(status) = std::str::from_utf8(status_bytes) {
                            found_status = Some(SpecificStatus {
                                app: rec.app.to_string(),
                                status: status.to_string(),
                            });
                        }
                        rest = &after[end + rec.suffix.len()..];
                        continue 'scan;
                    }
                }
            }
            filtered.push(rest[0]);
            rest = &rest[1..];
        }

        if found_status.is_some() {
            self.specific_status = found_status;
        }

        let transitioned = !was_active; // we just observed output: always active now
        Observation {
            filtered,
            transitioned,
            state: ActivityState {
                is_active: true,
                last_activity_at: Some(now_epoch_secs),
                specific_status: self.specific_status.clone(),
            },
        }
    }

    /// Re-evaluate idle classification without new output (called by the
    /// sweep tick). Returns `Some` only once per idle stretch, the call
    /// where the classification just flipped to idle — later calls while
    /// still idle return `None` until the next [`Self::observe`].
    pub fn tick_idle(&mut self) -> Option<ActivityState> {
        if self.idle_notified {
            return None;
        }
        if self.last_output_at.is_some() && !self.is_active() {
            self.idle_notified = true;
            Some(ActivityState {
                is_active: false,
                last_activity_at: None,
                specific_status: self.specific_status.clone(),
            })
        } else {
            None
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_has_no_status() {
        let mut det = ActivityDetector::new();
        let obs = det.observe(b"hello world\n", 0);
        assert_eq!(obs.filtered, b"hello world\n");
        assert!(obs.state.specific_status.is_none());
        assert!(obs.state.is_active);
    }

    #[test]
    fn marker_is_extracted_and_filtered() {
        let mut det = ActivityDetector::new();
        let data = b"before\x1b]9993;waiting for input\x07after".to_vec();
        let obs = det.observe(&data, 0);
        assert_eq!(obs.filtered, b"beforeafter");
        let status = obs.state.specific_status.expect("status extracted");
        assert_eq!(status.app, "claude");
        assert_eq!(status.status, "waiting for input");
    }

    #[test]
    fn idle_before_any_output() {
        let mut det = ActivityDetector::new();
        assert!(!det.is_active());
        assert!(det.tick_idle().is_none());
    }

    #[test]
    fn tick_idle_fires_once_per_idle_stretch() {
        let mut det = ActivityDetector::new();
        det.observe(b"hi", 0);
        // Force the active window to have elapsed without waiting in real time.
        det.last_output_at = Some(Instant::now() - ACTIVE_WINDOW - std::time::Duration::from_millis(1));
        assert!(det.tick_idle().is_some());
        assert!(det.tick_idle().is_none());
        det.observe(b"more", 0);
        det.last_output_at = Some(Instant::now() - ACTIVE_WINDOW - std::time::Duration::from_millis(1));
        assert!(det.tick_idle().is_some());
    }
}
