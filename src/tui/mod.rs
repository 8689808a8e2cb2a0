mod clipboard;
mod help;
mod state;

use crate::cli::{launcher_config, Cli};
use crate::launcher::Launcher;
use crate::model::{is_nifti_path, Alert, JobEvent, OutputStream, Severity};
use crate::orchestrator::{self, UiCommand};
use crate::params;
use anyhow::{Context, Result};
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Tabs, Wrap},
    Frame, Terminal,
};
use state::{tail_fit, Focus, JobStatus, UiState};
use std::{io, time::Duration};
use tokio::sync::mpsc;

const TITLE: &str = "Elastix Registration";
const LABEL_WIDTH: u16 = 18;
const PAGE: usize = 10;

type Term = Terminal<CrosstermBackend<io::Stdout>>;

/// What a key press asks the loop to do beyond mutating `UiState`.
#[derive(Debug)]
enum KeyAction {
    None,
    Command(UiCommand),
    CopyOutput,
    Quit,
}

pub async fn run(args: Cli) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // Without parameter files only the error is shown, and no controller exists to take jobs.
    let (mut state, controller) = match params::discover(&args.parameter_dir()) {
        Ok(files) => {
            let mut state = UiState::new(files);
            prefill(&mut state, &args);
            let launcher = Launcher::new(launcher_config(&args));
            let handle = tokio::spawn(orchestrator::run_controller(launcher, event_tx, cmd_rx));
            (state, Some(handle))
        }
        Err(e) => {
            tracing::error!("{e}");
            (UiState::fatal(Alert::error(e.to_string())), None)
        }
    };
    let fatal_message = state
        .fatal
        .then(|| state.alert.as_ref().map(|a| a.message.clone()))
        .flatten();

    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let res = ui_loop(&mut terminal, &mut state, &mut event_rx, &cmd_tx).await;

    if let Some(handle) = controller {
        if state.is_running() {
            state.info = "Stopping elastix…".into();
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
        }
        drop(cmd_tx);
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("controller failed: {e:#}"),
            Err(e) => tracing::error!("controller task failed: {e}"),
        }
    }

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res?;
    match fatal_message {
        Some(msg) => Err(anyhow::anyhow!(msg)),
        None => Ok(()),
    }
}

/// Seed the form from command-line arguments.
fn prefill(state: &mut UiState, args: &Cli) {
    if let Some(p) = &args.reference {
        state.reference = p.display().to_string();
    }
    if let Some(p) = &args.moving {
        state.set_moving(p.display().to_string());
    }
    if let Some(p) = &args.output {
        state.output_folder = p.display().to_string();
    }
    if let Some(wanted) = &args.parameter_file {
        if !state.select_parameter(wanted) {
            state.alert = Some(Alert::warning(format!(
                "Parameter file '{wanted}' is not in the parameter-files folder."
            )));
        }
    }
}

async fn ui_loop(
    terminal: &mut Term,
    state: &mut UiState,
    event_rx: &mut mpsc::UnboundedReceiver<JobEvent>,
    cmd_tx: &mpsc::UnboundedSender<UiCommand>,
) -> Result<()> {
    let mut input = EventStream::new();
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut dirty = true;

    loop {
        tokio::select! {
            maybe = input.next() => {
                match maybe {
                    Some(Ok(Event::Key(k))) if k.kind == KeyEventKind::Press => {
                        match handle_key(state, k) {
                            KeyAction::None => {}
                            KeyAction::Command(cmd) => {
                                let _ = cmd_tx.send(cmd);
                            }
                            KeyAction::CopyOutput => {
                                state.info = match clipboard::copy_output(&state.output_text()) {
                                    Ok(()) => format!("Copied {} output entries to the clipboard", state.output.len()),
                                    Err(e) => format!("Clipboard copy failed: {e:#}"),
                                };
                            }
                            KeyAction::Quit => {
                                let _ = cmd_tx.send(UiCommand::Quit);
                                return Ok(());
                            }
                        }
                        // Draw right away so typing feels immediate.
                        terminal.draw(|f| draw(f.area(), f, state)).ok();
                        dirty = false;
                    }
                    Some(Ok(Event::Resize(..))) => dirty = true,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        return Err(e).context("read terminal input");
                    }
                    None => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        return Ok(());
                    }
                }
            }
            Some(ev) = event_rx.recv() => {
                state.apply_event(ev);
                dirty = true;
            }
            _ = tick.tick() => {
                if dirty {
                    terminal.draw(|f| draw(f.area(), f, state)).ok();
                    dirty = false;
                }
            }
        }
    }
}

fn handle_key(state: &mut UiState, k: KeyEvent) -> KeyAction {
    // AltGr arrives as Ctrl+Alt on Windows; those are characters, not shortcuts.
    let ctrl = k.modifiers.contains(KeyModifiers::CONTROL) && !k.modifiers.contains(KeyModifiers::ALT);
    if ctrl && matches!(k.code, KeyCode::Char('c') | KeyCode::Char('q')) {
        return KeyAction::Quit;
    }

    if state.alert.is_some() {
        if matches!(k.code, KeyCode::Enter | KeyCode::Esc | KeyCode::Char(' ')) && state.dismiss_alert() {
            return KeyAction::Quit;
        }
        return KeyAction::None;
    }
    if state.fatal {
        return KeyAction::Quit;
    }

    if k.code == KeyCode::F(1) {
        state.tab = if state.tab == 0 { 1 } else { 0 };
        return KeyAction::None;
    }
    if state.tab == 1 {
        if k.code == KeyCode::Esc {
            state.tab = 0;
        }
        return KeyAction::None;
    }

    if ctrl {
        match k.code {
            KeyCode::Char('r') => return register(state),
            KeyCode::Char('x') => return KeyAction::Command(UiCommand::Cancel),
            KeyCode::Char('y') => return KeyAction::CopyOutput,
            KeyCode::Char('l') => {
                state.clear_output();
                state.info = "Output cleared".into();
            }
            KeyCode::Char('u') => state.clear_field(),
            _ => {}
        }
        return KeyAction::None;
    }

    let on_pane = state.focus == Focus::OutputPane;
    match k.code {
        KeyCode::Tab => state.focus_next(),
        KeyCode::BackTab => state.focus_prev(),
        KeyCode::PageUp => state.scroll_up(PAGE),
        KeyCode::PageDown => state.scroll_down(PAGE),
        KeyCode::Up if on_pane => state.scroll_up(1),
        KeyCode::Down if on_pane => state.scroll_down(1),
        KeyCode::Up => state.focus_prev(),
        KeyCode::Down => state.focus_next(),
        KeyCode::Home if on_pane => state.scroll_to_top(),
        KeyCode::End if on_pane => state.follow_tail(),
        KeyCode::Left => match state.focus {
            Focus::Parameter => state.cycle_parameter(false),
            Focus::OutputPane => state.hscroll = state.hscroll.saturating_sub(4),
            _ => {}
        },
        KeyCode::Right => match state.focus {
            Focus::Parameter => state.cycle_parameter(true),
            Focus::OutputPane => state.hscroll = state.hscroll.saturating_add(4),
            _ => {}
        },
        KeyCode::Enter => match state.focus {
            Focus::Register => return register(state),
            Focus::OutputPane => {}
            _ => state.focus_next(),
        },
        KeyCode::Backspace => state.backspace(),
        KeyCode::Char(c) => state.insert_char(c),
        _ => {}
    }
    KeyAction::None
}

fn register(state: &mut UiState) -> KeyAction {
    state.commit_moving();
    KeyAction::Command(UiCommand::Register(state.request()))
}

fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    if state.fatal {
        f.render_widget(Block::default().borders(Borders::ALL).title(TITLE), area);
    } else {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(3), Constraint::Min(0)])
            .split(area);

        let tabs = Tabs::new(vec![Line::from("Register"), Line::from("Help")])
            .select(state.tab)
            .block(Block::default().borders(Borders::ALL).title(TITLE))
            .highlight_style(Style::default().fg(Color::Yellow));
        f.render_widget(tabs, chunks[0]);

        match state.tab {
            0 => draw_register(chunks[1], f, state),
            _ => help::draw_help(chunks[1], f),
        }
    }

    if let Some(alert) = &state.alert {
        draw_alert(area, f, alert);
    }
}

fn draw_register(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(7), // Paths, parameter file, Register button
            Constraint::Min(3),    // elastix output
            Constraint::Length(4), // Status
        ])
        .split(area);

    draw_form(rows[0], f, state);
    draw_output(rows[1], f, state);
    draw_status(rows[2], f, state);
}

fn label_span(label: &str, focused: bool) -> Span<'static> {
    let style = if focused {
        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(Color::Gray)
    };
    Span::styled(
        format!("{:<width$}", label, width = LABEL_WIDTH as usize),
        style,
    )
}

fn draw_form(area: Rect, f: &mut Frame, state: &UiState) {
    let block = Block::default().borders(Borders::ALL).title("Registration");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1); 5])
        .split(inner);
    let value_width = inner.width.saturating_sub(LABEL_WIDTH + 1) as usize;

    let fields = [
        (Focus::Reference, "Reference image", &state.reference, "No reference image selected", true),
        (Focus::Moving, "Moving image", &state.moving, "No moving image selected", true),
        (Focus::Output, "Output folder", &state.output_folder, "No output folder selected", false),
    ];
    for (i, (focus, label, value, placeholder, image)) in fields.into_iter().enumerate() {
        let focused = state.focus == focus;
        let shown = tail_fit(value, value_width);
        let value_span = if value.is_empty() {
            Span::styled(placeholder, Style::default().fg(Color::DarkGray))
        } else if image && !is_nifti_path(std::path::Path::new(value.trim())) {
            Span::styled(shown.clone(), Style::default().fg(Color::Yellow))
        } else {
            Span::raw(shown.clone())
        };
        f.render_widget(
            Paragraph::new(Line::from(vec![label_span(label, focused), value_span])),
            rows[i],
        );
        if focused {
            let x = rows[i].x + LABEL_WIDTH + shown.chars().count() as u16;
            f.set_cursor_position((x.min(rows[i].right().saturating_sub(1)), rows[i].y));
        }
    }

    let param_focused = state.focus == Focus::Parameter;
    let param_value = match state.selected_parameter() {
        Some(p) => vec![
            Span::styled("◀ ", Style::default().fg(Color::Magenta)),
            Span::raw(tail_fit(&p.label, value_width.saturating_sub(12))),
            Span::styled(" ▶", Style::default().fg(Color::Magenta)),
            Span::styled(
                format!("  ({}/{})", state.parameter_selected + 1, state.parameter_files.len()),
                Style::default().fg(Color::DarkGray),
            ),
        ],
        None => vec![Span::styled("No parameter files", Style::default().fg(Color::Red))],
    };
    let mut param_line = vec![label_span("Parameter file", param_focused)];
    param_line.extend(param_value);
    f.render_widget(Paragraph::new(Line::from(param_line)), rows[3]);

    let button = if state.is_running() {
        Span::styled("[ Running… ]", Style::default().fg(Color::DarkGray))
    } else if state.focus == Focus::Register {
        Span::styled(
            "[ Register ]",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::REVERSED),
        )
    } else {
        Span::styled("[ Register ]", Style::default().fg(Color::Yellow))
    };
    f.render_widget(Paragraph::new(Line::from(button).centered()), rows[4]);
}

fn draw_output(area: Rect, f: &mut Frame, state: &UiState) {
    let dark = Style::default().bg(Color::Black).fg(Color::White);
    let mut title = vec![Span::raw("Output")];
    if state.focus == Focus::OutputPane {
        title.push(Span::styled(" (focused)", Style::default().fg(Color::Yellow)));
    }
    if state.scroll_from_bottom > 0 {
        title.push(Span::styled(
            " (scrolled; End follows new output)",
            Style::default().fg(Color::DarkGray),
        ));
    }

    let height = area.height.saturating_sub(2) as usize;
    let start = state.first_visible_line(height);
    let lines: Vec<Line> = state
        .output_lines()
        .skip(start)
        .take(height)
        .map(|(stream, text)| {
            let text = text.replace('\t', "    ");
            match stream {
                OutputStream::Stdout => Line::raw(text),
                OutputStream::Stderr => Line::styled(text, Style::default().fg(Color::LightRed)),
            }
        })
        .collect();

    // No wrap: long elastix lines scroll sideways instead.
    let p = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(Line::from(title)))
        .style(dark)
        .scroll((0, state.hscroll));
    f.render_widget(p, area);
}

fn draw_status(area: Rect, f: &mut Frame, state: &UiState) {
    let job = match &state.status {
        JobStatus::Idle => Span::styled("idle", Style::default().fg(Color::Gray)),
        JobStatus::Running { job, started_at } => Span::styled(
            format!("#{job} running since {started_at}"),
            Style::default().fg(Color::Cyan),
        ),
        JobStatus::Finished { job, outcome } => {
            let color = if outcome.is_success() {
                Color::Green
            } else {
                Color::Red
            };
            Span::styled(
                format!("#{job} {}", outcome.to_message()),
                Style::default().fg(color),
            )
        }
    };

    let p = Paragraph::new(vec![
        Line::from(vec![Span::styled("Job: ", Style::default().fg(Color::Gray)), job]),
        Line::from(state.info.clone()),
    ])
    .wrap(Wrap { trim: true })
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title("Status")
            .title_bottom(Line::from(vec![
                Span::styled(" F1", Style::default().fg(Color::Magenta)),
                Span::raw(" help  "),
                Span::styled("Ctrl-R", Style::default().fg(Color::Magenta)),
                Span::raw(" register  "),
                Span::styled("Ctrl-X", Style::default().fg(Color::Magenta)),
                Span::raw(" cancel  "),
                Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
                Span::raw(" quit "),
            ])),
    );
    f.render_widget(p, area);
}

fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

/// Modal message box; input is blocked until it is dismissed.
fn draw_alert(area: Rect, f: &mut Frame, alert: &Alert) {
    let color = match alert.severity {
        Severity::Info => Color::Green,
        Severity::Warning => Color::Yellow,
        Severity::Error => Color::Red,
    };
    let msg_len = alert.message.chars().count().min(400) as u16;
    let width = (msg_len + 6).clamp(30, 72);
    let text_width = width.saturating_sub(4).max(1);
    let height = msg_len.div_ceil(text_width).max(1) + 4;
    let rect = centered_rect(width, height, area);

    f.render_widget(Clear, rect);
    let p = Paragraph::new(vec![
        Line::from(alert.message.clone()),
        Line::from(""),
        Line::from(Span::styled(
            "[ OK ]",
            Style::default().fg(color).add_modifier(Modifier::REVERSED),
        ))
        .centered(),
    ])
    .wrap(Wrap { trim: true })
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(color))
            .title(alert.title.clone()),
    );
    f.render_widget(p, rect);
}
