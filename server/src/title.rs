//! Title manager (C4).
//!
//! Generates and injects OSC-2 title sequences per a configured policy, and
//! tracks the session's current working directory by sniffing `cd` commands
//! in the input stream. Titles are injected only into output addressed to
//! terminal-attached consumers (the `vt` forwarder) — never into the byte
//! stream fed to browser consumers (WebSocket/SSE).

use crate::activity::ActivityState;

/// OSC sequence prefix/terminator used both for stripping and injection.
/// `\x1b]0;`, `\x1b]1;`, `\x1b]2;` set icon name / window title / both; BEL
/// (`\x07`) or ST (`\x1b\\`) terminates.
const OSC_TITLE_KINDS: [&str; 3] = ["0", "1", "2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMode {
    None,
    Filter,
    Static,
    Dynamic,
}

impl Default for TitleMode {
    fn default() -> Self {
        TitleMode::None
    }
}

/// Minimum interval between dynamic-mode title refreshes driven purely by
/// activity transitions (not by a fresh burst ending at a prompt).
const DYNAMIC_REFRESH_CADENCE: std::time::Duration = std::time::Duration::from_millis(500);

pub struct TitleManager {
    mode: TitleMode,
    command_label: String,
    session_name: Option<String>,
    cwd: String,
    last_dynamic_refresh: Option<std::time::Instant>,
}

impl TitleManager {
    pub fn new(mode: TitleMode, command_label: String, cwd: String) -> Self {
        TitleManager {
            mode,
            command_label,
            session_name: None,
            cwd,
            last_dynamic_refresh: None,
        }
    }

    pub fn set_mode(&mut self, mode: TitleMode) {
        self.mode = mode;
    }

    pub fn set_session_name(&mut self, name: Option<String>) {
        self.session_name = name;
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn mode(&self) -> TitleMode {
        self.mode
    }

    /// Transform a chunk of output according to the configured mode. Called
    /// only on the path feeding a terminal-attached consumer.
    pub fn transform_output(&mut self, data: &[u8], activity: &ActivityState) -> Vec<u8> {
        match self.mode {
            TitleMode::None => data.to_vec(),
            TitleMode::Filter => strip_title_sequences(data),
            TitleMode::Static => {
                let stripped = strip_title_sequences(data);
                if ends_at_prompt(&stripped) {
                    let mut out = stripped;
                    out.extend_from_slice(self.render_title(None).as_bytes());
                    out
                } else {
                    stripped
                }
            }
            TitleMode::Dynamic => {
                let stripped = strip_title_sequences(data);
                let should_refresh = ends_at_prompt(&stripped) || self.dynamic_cadence_elapsed();
                if should_refresh {
                    self.last_dynamic_refresh = Some(std::time::Instant::now());
                    let glyph = activity.specific_status.as_ref().map(|s| s.status.as_str());
                    let mut out = stripped;
                    out.extend_from_slice(self.render_title(glyph).as_bytes());
                    out
                } else {
                    stripped
                }
            }
        }
    }

    fn dynamic_cadence_elapsed(&self) -> bool {
        self.last_dynamic_refresh
            .is_none_or(|t| t.elapsed() >= DYNAMIC_REFRESH_CADENCE)
    }

    fn render_title(&self, glyph: Option<&str>) -> String {
        let basename = self
            .command_label
            .rsplit('/')
            .next()
            .unwrap_or(&self.command_label);
        let mut title = format!("{} · {}", self.cwd, basename);
        if let Some(name) = &self.session_name {
            title.push_str(" · ");
            title.push_str(name);
        }
        if let Some(g) = glyph {
            title = format!("{g} {title}");
        }
        format!("\x1b]2;{title}\x07")
    }

    /// Scan input bytes for a leading `cd` command and update `cwd` if one is
    /// found and resolvable. `cd -` is explicitly unresolvable and ignored.
    pub fn observe_input(&mut self, data: &[u8]) {
        let Ok(text) = std::str::from_utf8(data) else {
            return;
        };
        for line in text.split(['\n', '\r']) {
            if let Some(target) = parse_cd_target(line.trim()) {
                self.cwd = resolve_cwd(&self.cwd, &target);
            }
        }
    }
}

fn strip_title_sequences(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b && data.get(i + 1) == Some(&b']') {
            if let Some((kind_end, is_osc_title)) = osc_kind(&data[i + 2..]) {
                if is_osc_title {
                    if let Some(term_len) = find_terminator(&data[i + 2 + kind_end..]) {
                        i += 2 + kind_end + term_len;
                        continue;
                    }
                }
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Returns `(bytes consumed for "N;", is a title-setting OSC)`.
fn osc_kind(rest: &[u8]) -> Option<(usize, bool)> {
    let semi = rest.iter().position(|&b| b == b';')?;
    let kind = std::str::from_utf8(&rest[..semi]).ok()?;
    Some((semi + 1, OSC_TITLE_KINDS.contains(&kind)))
}

fn find_terminator(rest: &[u8]) -> Option<usize> {
    for (idx, &b) in rest.iter().enumerate() {
        if b == 0x07 {
            return Some(idx + 1);
        }
        if b == 0x1b && rest.get(idx + 1) == Some(&b'\\') {
            return Some(idx + 2);
        }
    }
    None
}

/// A burst "looks like a prompt" if it ends right after a newline followed
/// by no further output — a conservative heuristic: the last non-empty line
/// does not itself end with a newline (i.e. the cursor is sitting mid-line
/// waiting for input).
fn ends_at_prompt(data: &[u8]) -> bool {
    !data.is_empty() && data.last() != Some(&b'\n')
}

fn parse_cd_target(line: &str) -> Option<String> {
    let rest = line.strip_prefix("cd")?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None; // e.g. "cdfoo" — not the `cd` builtin
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return Some("~".to_string());
    }
    let arg = rest.split_whitespace().next()?;
    if arg == "-" {
        return None;
    }
    let unquoted = arg.trim_matches(['"', '\'']);
    Some(unquoted.to_string())
}

fn resolve_cwd(current: &str, target: &str) -> String {
    if let Some(rest) = target.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        return format!("{home}{rest}");
    }
    if target.starts_with('/') {
        return target.to_string();
    }
    if current.ends_with('/') {
        format!("{current}{target}")
    } else {
        format!("{current}/{target}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_mode_strips_osc_title() {
        let data = b"pre\x1b]2;evil title\x07post".to_vec();
        let out = strip_title_sequences(&data);
        assert_eq!(out, b"prepost");
    }

    #[test]
    fn filter_mode_leaves_other_osc_alone() {
        let data = b"pre\x1b]52;c;AAAA\x07post".to_vec();
        let out = strip_title_sequences(&data);
        assert_eq!(out, data);
    }

    #[test]
    fn cd_absolute_updates_cwd() {
        let mut mgr = TitleManager::new(TitleMode::None, "bash".into(), "/home/user".into());
        mgr.observe_input(b"cd /tmp\n");
        assert_eq!(mgr.cwd(), "/tmp");
    }

    #[test]
    fn cd_relative_joins_current_cwd() {
        let mut mgr = TitleManager::new(TitleMode::None, "bash".into(), "/home/user".into());
        mgr.observe_input(b"cd projects\n");
        assert_eq!(mgr.cwd(), "/home/user/projects");
    }

    #[test]
    fn cd_dash_is_ignored() {
        let mut mgr = TitleManager::new(TitleMode::None, "bash".into(), "/home/user".into());
        mgr.observe_input(b"cd -\n");
        assert_eq!(mgr.cwd(), "/home/user");
    }

    #[test]
    fn static_mode_injects_title_at_prompt() {
        let mut mgr = TitleManager::new(TitleMode::Static, "bash".into(), "/tmp".into());
        let activity = ActivityState::default();
        let out = mgr.transform_output(b"$ ", &activity);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\x1b]2;"));
        assert!(text.starts_with("$ "));
    }
}
