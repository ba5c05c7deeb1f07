//! Build progress tracking and reporting, for the purpose of display to the
//! user.

use crate::graph::{Action, ActionId};
use crate::terminal;
use crate::work::{ActionOutcome, ActionState, StateCounts};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Compute the message to display on the console for a given action.
pub fn action_message(action: &Action) -> String {
    if action.progress_message.is_empty() {
        action.describe()
    } else {
        action.progress_message.clone()
    }
}

/// Receives action lifecycle events in order.  Purely observational: nothing
/// here can affect the build.
pub trait Progress {
    /// Called whenever the per-state counts change.
    fn update(&mut self, counts: &StateCounts);

    /// Called as an action moves to a new state.
    fn action_state(&mut self, id: ActionId, action: &Action, state: ActionState);

    /// Called once when an action reaches a final state.
    fn action_finished(&mut self, id: ActionId, action: &Action, outcome: &ActionOutcome);

    /// Log a line of output without corrupting the progress display.
    /// This line is persisted beyond further progress updates.  For example,
    /// used when an action fails; we want the final output to show that failed
    /// action's output even if we do more work after it fails.
    fn log(&mut self, msg: &str);
}

fn failure_text(action: &Action, outcome: &ActionOutcome) -> Option<String> {
    if !outcome.state.is_failure() {
        return None;
    }
    Some(match &outcome.message {
        Some(msg) => format!("FAILED: {}", msg),
        None => format!("FAILED: {}", action.describe()),
    })
}

fn write_output(outcome: &ActionOutcome) {
    if let Some(result) = &outcome.result {
        let mut stdout = std::io::stdout().lock();
        // Nowhere to report a broken stdout.
        let _ = stdout.write_all(&result.stdout);
        let _ = stdout.write_all(&result.stderr);
    }
}

fn has_output(outcome: &ActionOutcome) -> bool {
    outcome
        .result
        .as_ref()
        .map_or(false, |r| !r.stdout.is_empty() || !r.stderr.is_empty())
}

/// Progress implementation for "dumb" console, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// Whether to print command lines of started actions.
    verbose: bool,

    /// The id of the last action printed, used to avoid printing it twice
    /// when we have two updates from the same action in a row.
    last_started: Option<ActionId>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last_started: None,
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn action_state(&mut self, id: ActionId, action: &Action, state: ActionState) {
        if state != ActionState::Executing {
            return;
        }
        self.log(&if self.verbose {
            action.command.to_string()
        } else {
            action_message(action)
        });
        self.last_started = Some(id);
    }

    fn action_finished(&mut self, id: ActionId, action: &Action, outcome: &ActionOutcome) {
        if let Some(text) = failure_text(action, outcome) {
            self.log(&text);
        } else if has_output(outcome) && self.last_started != Some(id) {
            self.log(&action_message(action));
        }
        write_output(outcome);
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation for "fancy" console, with progress bar etc.
/// Each time it prints, it clears from the cursor to the end of the console,
/// prints the status text, and then moves moves the cursor back up to the
/// start position.  This means on errors etc. we can clear any status by
/// clearing the console too.
pub struct FancyConsoleProgress {
    state: Arc<Mutex<FancyState>>,
    dirty_cond: Arc<Condvar>,
}

/// Screen updates happen after this duration passes, to reduce the amount
/// of printing in the case of rapid updates.  This helps with terminal flicker.
const UPDATE_DELAY: Duration = Duration::from_millis(50);

impl FancyConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        let dirty_cond = Arc::new(Condvar::new());
        let state = Arc::new(Mutex::new(FancyState {
            done: false,
            dirty: false,
            counts: StateCounts::default(),
            running: VecDeque::new(),
            verbose,
        }));

        // Thread to debounce status updates -- waits a bit, then prints after
        // any dirty state.
        std::thread::spawn({
            let state = state.clone();
            let dirty_cond = dirty_cond.clone();
            move || loop {
                // Wait to be notified of a display update, or timeout at 500ms.
                // The timeout is for the case where there are lengthy actions
                // and the progress will show how long they've been running.
                {
                    let mut state = state.lock();
                    if !state.dirty {
                        dirty_cond.wait_for(&mut state, Duration::from_millis(500));
                    }
                    if state.done {
                        break;
                    }
                }

                // Delay a little bit in case more display updates come in.
                std::thread::sleep(UPDATE_DELAY);

                // Update regardless of whether we timed out or not.
                state.lock().print_progress();
            }
        });

        FancyConsoleProgress { state, dirty_cond }
    }

    fn with_state(&self, f: impl FnOnce(&mut FancyState)) {
        f(&mut self.state.lock());
        self.dirty_cond.notify_one();
    }
}

impl Progress for FancyConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.with_state(|s| s.update(counts));
    }

    fn action_state(&mut self, id: ActionId, action: &Action, state: ActionState) {
        self.with_state(|s| s.action_state(id, action, state));
    }

    fn action_finished(&mut self, id: ActionId, action: &Action, outcome: &ActionOutcome) {
        self.with_state(|s| s.action_finished(id, action, outcome));
    }

    fn log(&mut self, msg: &str) {
        self.with_state(|s| s.log(msg));
    }
}

impl Drop for FancyConsoleProgress {
    fn drop(&mut self) {
        self.with_state(|s| s.cleanup());
    }
}

/// Currently executing action, as tracked for progress updates.
struct Running {
    id: ActionId,
    /// When the action started executing.
    start: Instant,
    message: String,
}

struct FancyState {
    done: bool,
    dirty: bool,
    counts: StateCounts,
    /// Actions that are currently executing.
    /// Pushed to as actions start, so it's always in order of age.
    running: VecDeque<Running>,
    /// Whether to print command lines of started actions.
    verbose: bool,
}

impl FancyState {
    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
        self.dirty = true;
    }

    fn action_state(&mut self, id: ActionId, action: &Action, state: ActionState) {
        if state != ActionState::Executing {
            return;
        }
        if self.verbose {
            self.log(&action.command.to_string());
        }
        self.running.push_back(Running {
            id,
            start: Instant::now(),
            message: action_message(action),
        });
        self.dirty = true;
    }

    fn action_finished(&mut self, id: ActionId, action: &Action, outcome: &ActionOutcome) {
        if let Some(pos) = self.running.iter().position(|r| r.id == id) {
            self.running.remove(pos);
        }
        if let Some(text) = failure_text(action, outcome) {
            self.log(&text);
        } else if has_output(outcome) {
            self.log(&action_message(action));
        }
        if has_output(outcome) {
            self.clear_progress();
            write_output(outcome);
        }
        self.dirty = true;
    }

    fn log(&mut self, msg: &str) {
        self.clear_progress();
        println!("{}", msg);
        self.dirty = true;
    }

    fn cleanup(&mut self) {
        self.clear_progress();
        self.done = true;
        self.dirty = true; // let thread quit
    }

    fn clear_progress(&self) {
        // If the user hit ctl-c, it may have printed something on the line.
        // So \r to go to first column first, then clear anything below.
        let _ = std::io::stdout().write_all(b"\r\x1b[J");
    }

    fn print_progress(&mut self) {
        self.clear_progress();
        let failed = self.counts.failed();
        let mut progress_line = format!(
            "[{}] {}/{} done, ",
            progress_bar(&self.counts, 40),
            self.counts.finished(),
            self.counts.total()
        );
        if failed > 0 {
            progress_line.push_str(&format!("{} failed, ", failed));
        }
        progress_line.push_str(&format!("{} running", self.running.len()));
        println!("{}", progress_line);
        let mut lines = 1;

        let max_cols = terminal::get_cols().unwrap_or(80);
        let max_running = 8;
        let now = Instant::now();
        for running in self.running.iter().take(max_running) {
            let delta = now.duration_since(running.start).as_secs() as usize;
            println!("{}", action_line(&running.message, delta, max_cols));
            lines += 1;
        }

        if self.running.len() > max_running {
            println!("...and {} more", self.running.len() - max_running);
            lines += 1;
        }

        // Move cursor up to the first printed line, for overprinting.
        print!("\x1b[{}A", lines);
        let _ = std::io::stdout().flush();
        self.dirty = false;
    }
}

/// Format an action's status message to optionally include how long it has
/// been running and also to fit within a maximum number of terminal columns.
fn action_line(message: &str, seconds: usize, max_cols: usize) -> String {
    let time_note = if seconds > 2 {
        format!(" ({}s)", seconds)
    } else {
        "".into()
    };
    let mut out = message.to_owned();
    if out.len() + time_note.len() >= max_cols {
        out = truncate(message, max_cols.saturating_sub(time_note.len() + 3)).to_owned();
        out.push_str("...");
    }
    out.push_str(&time_note);
    out
}

/// Cut `s` to at most `max` bytes, backing off to a char boundary.
fn truncate(s: &str, mut max: usize) -> &str {
    if max >= s.len() {
        return s;
    }
    while !s.is_char_boundary(max) {
        max -= 1;
    }
    &s[..max]
}

/// Render a StateCounts as an ASCII progress bar: finished, in flight, not
/// yet started.
fn progress_bar(counts: &StateCounts, bar_size: usize) -> String {
    let mut bar = String::with_capacity(bar_size);
    let mut sum: usize = 0;
    let total = counts.total();
    if total == 0 {
        return " ".repeat(bar_size);
    }
    let waiting = counts.get(ActionState::NotStarted);
    let finished = counts.finished();
    let in_flight = total - waiting - finished;
    for (count, ch) in [(finished, '='), (in_flight, '-'), (waiting, ' ')] {
        sum += count;
        let mut target_size = sum * bar_size / total;
        if count > 0 && target_size == bar.len() && target_size < bar_size {
            // Special case: for non-zero count, ensure we always get at least
            // one tick.
            target_size += 1;
        }
        while bar.len() < target_size {
            bar.push(ch);
        }
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_rendering() {
        let mut counts = StateCounts::default();

        // Don't crash if we show progress before having any actions.
        assert_eq!(progress_bar(&counts, 10), "          ");

        counts.add(ActionState::NotStarted, 100);
        assert_eq!(progress_bar(&counts, 10), "          ");

        counts.add(ActionState::NotStarted, -50);
        counts.add(ActionState::Executing, 50);
        assert_eq!(progress_bar(&counts, 10), "-----     ");

        counts.add(ActionState::Executing, -1);
        counts.add(ActionState::UpToDate, 1);
        assert_eq!(progress_bar(&counts, 10), "=----     ");

        counts.add(ActionState::NotStarted, -50);
        counts.add(ActionState::Scheduling, 50);
        assert_eq!(progress_bar(&counts, 10), "=---------");
    }

    #[test]
    fn action_line_rendering() {
        assert_eq!(action_line("Compiling a.c", 0, 80), "Compiling a.c");
        assert_eq!(action_line("Compiling a.c", 0, 10), "Compili...");
        assert_eq!(action_line("Compiling a.c", 5, 80), "Compiling a.c (5s)");
        assert_eq!(action_line("Compiling a.c", 5, 10), "Co... (5s)");
    }

    #[test]
    fn truncate_utf8() {
        let text = "Compiling ━━━━━━━━━━━━.c";
        for len in 0..text.len() {
            assert!(text.starts_with(truncate(text, len)));
        }
        for cols in 0..text.len() + 4 {
            let line = action_line(text, 0, cols);
            assert!(line.len() <= cols.max(3) || line == text, "{:?} at {}", line, cols);
        }
        assert_eq!(action_line(text, 0, 16), "Compiling ━...");
        assert_eq!(action_line(text, 0, 15), "Compiling ...");
    }
}
