mod tui_app;

use std::io;
use std::time::Duration;

use chrono::Utc;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tui_app::{format_accuracy, format_age, format_casp, format_filters, truncate, AppState, ConnectionStatus};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let owner = std::env::var("OWNER_ID").unwrap_or_else(|_| "default".to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url, owner);

    // Initial fetch before rendering
    app.reload(&client).await;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut entry_table_state = TableState::default();
    entry_table_state.select((!app.entries.is_empty()).then_some(0));

    let result = run_loop(&mut terminal, &mut app, &client, &mut entry_table_state).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
    entry_state: &mut TableState,
) -> io::Result<()> {
    let reload_interval = Duration::from_secs(5);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app, entry_state))?;

        let timeout = reload_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.reload(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Char('f') | KeyCode::Char('F') => {
                            let selected = entry_state.selected().and_then(|i| app.entries.get(i)).map(|e| e.id);
                            if let Some(id) = selected {
                                app.notice = Some(format!("#{id}: refreshing…"));
                                terminal.draw(|f| render(f, app, entry_state))?;
                                app.refresh_entry(client, id).await;
                                last_tick = std::time::Instant::now();
                            }
                        }
                        KeyCode::Down | KeyCode::Char('j') => {
                            let max = app.entries.len().saturating_sub(1);
                            let next = entry_state.selected().map_or(0, |i| (i + 1).min(max));
                            entry_state.select(Some(next));
                        }
                        KeyCode::Up | KeyCode::Char('k') => {
                            let prev = entry_state
                                .selected()
                                .map_or(0, |i| i.saturating_sub(1));
                            entry_state.select(Some(prev));
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= reload_interval {
            app.reload(client).await;
            last_tick = std::time::Instant::now();
        }

        // Entries may have been removed elsewhere.
        if let Some(i) = entry_state.selected() {
            if i >= app.entries.len() {
                entry_state.select(app.entries.len().checked_sub(1));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState, entry_state: &mut TableState) {
    let area = f.area();

    // Outer vertical split: header | body | footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // body
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, app, chunks[0]);
    render_body(f, app, entry_state, chunks[1]);
    render_footer(f, app, chunks[2]);
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (status_text, status_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let latency_str = app
        .latency
        .p95_ms
        .map_or("—".to_string(), |v| format!("p95 {v}ms ({})", app.latency.sample_count.unwrap_or(0)));
    let failures = app.health.acquisition_failures.unwrap_or(0);

    let title_spans = vec![
        Span::styled(
            " Comp Valuator  ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  "),
        Span::styled(format!("owner {}", app.owner), Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(
            format!("{} cached", app.health.cached_valuations.unwrap_or(0)),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(latency_str, Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(
            format!("{failures} acquisition failures"),
            Style::default().fg(if failures > 0 { Color::Yellow } else { Color::White }),
        ),
    ];

    let paragraph = Paragraph::new(Line::from(title_spans))
        .block(Block::default().borders(Borders::ALL).border_style(
            Style::default().fg(Color::DarkGray),
        ));

    f.render_widget(paragraph, area);
}

fn render_body(f: &mut Frame, app: &AppState, entry_state: &mut TableState, area: Rect) {
    // Horizontal split: watchlist (60%) | detail (40%)
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    render_entries_table(f, app, entry_state, halves[0]);
    render_detail(f, app, entry_state.selected(), halves[1]);
}

fn render_entries_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let now = Utc::now();
    let header_cells = ["#", "Query", "CASP", "Accuracy", "Refreshed"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1);

    let rows: Vec<Row> = app
        .entries
        .iter()
        .map(|e| {
            let v = e.last_valuation.as_ref();
            let accuracy_color = v.map_or(Color::DarkGray, |v| match v.accuracy_pct {
                60..=u8::MAX => Color::Green,
                30..=59 => Color::Yellow,
                _ => Color::Red,
            });
            let casp_color = match v {
                Some(v) if v.stale => Color::DarkGray,
                Some(_) => Color::White,
                None => Color::DarkGray,
            };

            Row::new(vec![
                Cell::from(e.id.to_string()).style(Style::default().fg(Color::DarkGray)),
                Cell::from(truncate(&e.display_text, 30)),
                Cell::from(format_casp(v)).style(Style::default().fg(casp_color)),
                Cell::from(format_accuracy(v)).style(Style::default().fg(accuracy_color)),
                Cell::from(format_age(e.last_refreshed_at, now)).style(Style::default().fg(Color::Cyan)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Min(12),
            Constraint::Length(14),
            Constraint::Length(15),
            Constraint::Length(9),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " WATCHLIST ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    )
    .row_highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    f.render_stateful_widget(table, area, state);
}

fn render_detail(f: &mut Frame, app: &AppState, selected: Option<usize>, area: Rect) {
    let label = Style::default().fg(Color::DarkGray);
    let lines: Vec<Line> = match selected.and_then(|i| app.entries.get(i)) {
        None => vec![Line::from(Span::styled("No entry selected", label))],
        Some(e) => {
            let mut lines = vec![
                Line::from(Span::styled(e.display_text.clone(), Style::default().add_modifier(Modifier::BOLD))),
                Line::from(vec![Span::styled("filters     ", label), Span::raw(format_filters(&e.filters))]),
                Line::from(vec![Span::styled("fingerprint ", label), Span::raw(e.fingerprint.clone())]),
                Line::from(vec![
                    Span::styled("added       ", label),
                    Span::raw(e.created_at.format("%Y-%m-%d %H:%M").to_string()),
                ]),
            ];
            match &e.last_valuation {
                Some(v) => {
                    lines.push(Line::from(""));
                    lines.push(Line::from(vec![Span::styled("CASP        ", label), Span::raw(format_casp(Some(v)))]));
                    lines.push(Line::from(vec![
                        Span::styled("accuracy    ", label),
                        Span::raw(format_accuracy(Some(v))),
                    ]));
                    lines.push(Line::from(vec![
                        Span::styled("comps       ", label),
                        Span::raw(v.sample_size.to_string()),
                    ]));
                    lines.push(Line::from(vec![
                        Span::styled("computed    ", label),
                        Span::raw(v.computed_at.format("%Y-%m-%d %H:%M").to_string()),
                    ]));
                    if v.stale {
                        lines.push(Line::from(Span::styled("stale", Style::default().fg(Color::Yellow))));
                    }
                }
                None => lines.push(Line::from(Span::styled("not valued yet", label))),
            }
            lines
        }
    };

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " DETAIL ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    );
    f.render_widget(paragraph, area);
}

fn render_footer(f: &mut Frame, app: &AppState, area: Rect) {
    let mut spans = vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("reload  "),
        Span::styled("[f] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh selected  "),
        Span::styled("[↑↓ / j k] ", Style::default().fg(Color::Yellow)),
        Span::raw("scroll  "),
    ];
    match &app.notice {
        Some(n) => spans.push(Span::styled(truncate(n, 60), Style::default().fg(Color::Cyan))),
        None => spans.push(Span::styled("auto-reload: 5s", Style::default().fg(Color::DarkGray))),
    }
    let paragraph = Paragraph::new(Line::from(spans)).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}
