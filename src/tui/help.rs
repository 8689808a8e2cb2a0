use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &str, pad: usize, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(key.to_string(), Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad.saturating_sub(key.chars().count()))),
        Span::raw(what.to_string()),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    const PAD: usize = 14;
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        key_line("Ctrl-C/Ctrl-Q", PAD, "Quit (stops a running registration)"),
        key_line("Tab/Shift-Tab", PAD, "Move between fields"),
        key_line("Enter", PAD, "Next field / press Register"),
        key_line("Ctrl-R", PAD, "Register"),
        key_line("Ctrl-X", PAD, "Cancel the running registration"),
        key_line("Ctrl-U", PAD, "Clear the focused path"),
        key_line("Ctrl-L", PAD, "Clear the output"),
        key_line("Ctrl-Y", PAD, "Copy the output to the clipboard"),
        key_line("F1", PAD, "Show/hide this help"),
        Line::from(""),
        Line::from("Parameter file:"),
        key_line("←/→", PAD, "Previous/next parameter file"),
        Line::from(""),
        Line::from("Output:"),
        key_line("PgUp/PgDn", PAD, "Scroll"),
        key_line("↑/↓", PAD, "Scroll one line (output focused)"),
        key_line("←/→", PAD, "Scroll sideways (output focused)"),
        key_line("Home/End", PAD, "Oldest output / follow new output"),
        Line::from(""),
        Line::from("Images are NIfTI volumes (*.nii, *.nii.gz); other names are highlighted."),
        Line::from("Parameter files are the *.txt files in the parameter-files folder."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
