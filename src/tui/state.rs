use crate::model::{
    default_output_folder, Alert, JobEvent, JobId, JobOutcome, JobRequest, OutputStream,
};
use crate::params::ParameterFile;
use std::path::PathBuf;

/// Focusable parts of the Register tab, in Tab order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Reference,
    Moving,
    Output,
    Parameter,
    Register,
    OutputPane,
}

impl Focus {
    const ORDER: [Focus; 6] = [
        Focus::Reference,
        Focus::Moving,
        Focus::Output,
        Focus::Parameter,
        Focus::Register,
        Focus::OutputPane,
    ];

    fn index(self) -> usize {
        Self::ORDER.iter().position(|f| *f == self).unwrap_or(0)
    }

    pub fn next(self) -> Focus {
        Self::ORDER[(self.index() + 1) % Self::ORDER.len()]
    }

    pub fn prev(self) -> Focus {
        Self::ORDER[(self.index() + Self::ORDER.len() - 1) % Self::ORDER.len()]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Running { job: JobId, started_at: String },
    Finished { job: JobId, outcome: JobOutcome },
}

/// One non-empty read from elastix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEntry {
    pub stream: OutputStream,
    pub text: String,
}

pub struct UiState {
    pub tab: usize,
    pub focus: Focus,

    pub reference: String,
    pub moving: String,
    pub output_folder: String,
    // Moving image edited since focus last left the field.
    moving_dirty: bool,

    pub parameter_files: Vec<ParameterFile>,
    pub parameter_selected: usize,

    pub output: Vec<OutputEntry>,
    pub output_line_count: usize,
    // Lines scrolled up from the tail; 0 follows new output.
    pub scroll_from_bottom: usize,
    pub hscroll: u16,

    pub status: JobStatus,
    pub info: String,
    pub alert: Option<Alert>,
    /// Set when the startup configuration is unusable; dismissing the alert exits.
    pub fatal: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            focus: Focus::Reference,
            reference: String::new(),
            moving: String::new(),
            output_folder: String::new(),
            moving_dirty: false,
            parameter_files: Vec::new(),
            parameter_selected: 0,
            output: Vec::new(),
            output_line_count: 0,
            scroll_from_bottom: 0,
            hscroll: 0,
            status: JobStatus::Idle,
            info: String::new(),
            alert: None,
            fatal: false,
        }
    }
}

impl UiState {
    pub fn new(parameter_files: Vec<ParameterFile>) -> Self {
        Self {
            parameter_files,
            info: "Fill in the paths, pick a parameter file and press Register.".into(),
            ..Default::default()
        }
    }

    /// State for a startup that cannot continue: only the alert is shown.
    pub fn fatal(alert: Alert) -> Self {
        Self {
            alert: Some(alert),
            fatal: true,
            ..Default::default()
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, JobStatus::Running { .. })
    }

    pub fn selected_parameter(&self) -> Option<&ParameterFile> {
        self.parameter_files.get(self.parameter_selected)
    }

    /// Snapshot the form as a job request. Blank fields stay empty.
    pub fn request(&self) -> JobRequest {
        let path = |s: &str| PathBuf::from(s.trim());
        JobRequest {
            reference_image: path(&self.reference),
            moving_image: path(&self.moving),
            output_folder: path(&self.output_folder),
            parameter_file: self
                .selected_parameter()
                .map(|p| p.path.clone())
                .unwrap_or_default(),
        }
    }

    pub fn set_moving(&mut self, moving: String) {
        self.moving = moving;
        self.moving_dirty = true;
        self.commit_moving();
    }

    /// Picking a moving image points the output folder at its directory.
    pub fn commit_moving(&mut self) {
        if !self.moving_dirty {
            return;
        }
        self.moving_dirty = false;
        let moving = self.moving.trim();
        if moving.is_empty() {
            return;
        }
        if let Some(dir) = default_output_folder(std::path::Path::new(moving)) {
            self.output_folder = dir.display().to_string();
        }
    }

    pub fn set_focus(&mut self, focus: Focus) {
        if self.focus == Focus::Moving && focus != Focus::Moving {
            self.commit_moving();
        }
        self.focus = focus;
    }

    pub fn focus_next(&mut self) {
        self.set_focus(self.focus.next());
    }

    pub fn focus_prev(&mut self) {
        self.set_focus(self.focus.prev());
    }

    fn focused_text_mut(&mut self) -> Option<&mut String> {
        match self.focus {
            Focus::Reference => Some(&mut self.reference),
            Focus::Moving => {
                self.moving_dirty = true;
                Some(&mut self.moving)
            }
            Focus::Output => Some(&mut self.output_folder),
            _ => None,
        }
    }

    pub fn insert_char(&mut self, c: char) {
        if let Some(text) = self.focused_text_mut() {
            text.push(c);
        }
    }

    pub fn backspace(&mut self) {
        if let Some(text) = self.focused_text_mut() {
            text.pop();
        }
    }

    pub fn clear_field(&mut self) {
        if let Some(text) = self.focused_text_mut() {
            text.clear();
        }
    }

    pub fn cycle_parameter(&mut self, forward: bool) {
        let n = self.parameter_files.len();
        if n == 0 {
            return;
        }
        self.parameter_selected = if forward {
            (self.parameter_selected + 1) % n
        } else {
            (self.parameter_selected + n - 1) % n
        };
    }

    pub fn select_parameter(&mut self, label_or_path: &str) -> bool {
        match crate::params::select(&self.parameter_files, label_or_path) {
            Ok(found) => {
                let found = found.clone();
                self.parameter_selected = self
                    .parameter_files
                    .iter()
                    .position(|p| *p == found)
                    .unwrap_or(0);
                true
            }
            Err(_) => false,
        }
    }

    pub fn apply_event(&mut self, ev: JobEvent) {
        match ev {
            JobEvent::Started {
                job, started_at, ..
            } => {
                self.status = JobStatus::Running { job, started_at };
                self.info = format!("Registration #{job} started");
            }
            JobEvent::Output { stream, text, .. } => self.push_output(stream, text),
            JobEvent::Finished { job, outcome } => {
                self.status = JobStatus::Finished { job, outcome };
                self.info = outcome.to_message();
                self.alert = Some(Alert::for_outcome(outcome));
            }
            JobEvent::Info(info) => self.info = info.to_message(),
            JobEvent::Alert(alert) => {
                self.info = alert.message.clone();
                self.alert = Some(alert);
            }
        }
    }

    /// Append one read as its own entry, minus a single trailing line terminator.
    pub fn push_output(&mut self, stream: OutputStream, mut text: String) {
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        let lines = text.split('\n').count();
        self.output_line_count += lines;
        if self.scroll_from_bottom > 0 {
            // Keep the view anchored while scrolled back.
            self.scroll_from_bottom += lines;
        }
        self.output.push(OutputEntry { stream, text });
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
        self.output_line_count = 0;
        self.scroll_from_bottom = 0;
        self.hscroll = 0;
    }

    /// Flattened display lines, oldest first.
    pub fn output_lines(&self) -> impl Iterator<Item = (OutputStream, &str)> + '_ {
        self.output
            .iter()
            .flat_map(|e| e.text.split('\n').map(move |l| (e.stream, l)))
    }

    /// Index of the first visible line for a pane `height` lines tall.
    pub fn first_visible_line(&self, height: usize) -> usize {
        let max_start = self.output_line_count.saturating_sub(height);
        max_start.saturating_sub(self.scroll_from_bottom)
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.scroll_from_bottom = (self.scroll_from_bottom + lines).min(self.output_line_count);
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.scroll_from_bottom = self.scroll_from_bottom.saturating_sub(lines);
    }

    pub fn scroll_to_top(&mut self) {
        self.scroll_from_bottom = self.output_line_count;
    }

    pub fn follow_tail(&mut self) {
        self.scroll_from_bottom = 0;
    }

    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Close the alert. Returns true when the application should exit.
    pub fn dismiss_alert(&mut self) -> bool {
        self.alert = None;
        self.fatal
    }
}

/// Fit `s` into `width` columns, keeping the end (the file name) visible.
pub fn tail_fit(s: &str, width: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= width {
        return s.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let keep = width - 1;
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("…{tail}")
}
