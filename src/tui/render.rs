use std::borrow::Cow;

use super::state::AppState;
use crate::model::{ExecutionStatus, NodeStatus, NodeUpdate, RunStatus};
use crate::sync::ConnectionStatus;
use chrono::{DateTime, Local, Utc};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};

const SPINNER_FRAMES: &[char] = &['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

pub fn draw(f: &mut Frame, state: &AppState, spinner_frame: u8) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Min(8),
            Constraint::Min(8),
            Constraint::Length(8),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, state, chunks[0], spinner_frame);
    draw_runs(f, state, chunks[1]);
    draw_timeline(f, state, chunks[2]);
    draw_logs(f, state, chunks[3]);
    draw_footer(f, chunks[4]);
}

fn connection_span(status: ConnectionStatus) -> Span<'static> {
    let color = match status {
        ConnectionStatus::Connected => Color::Green,
        ConnectionStatus::Connecting => Color::Yellow,
        ConnectionStatus::Disconnected => Color::DarkGray,
    };
    Span::styled(status.as_str().to_uppercase(), Style::default().fg(color))
}

fn run_status_color(status: &RunStatus) -> Color {
    match status {
        RunStatus::Queued => Color::Blue,
        RunStatus::Running => Color::Yellow,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled | RunStatus::Other(_) => Color::DarkGray,
    }
}

fn node_status_color(status: NodeStatus) -> Color {
    match status {
        NodeStatus::Waiting => Color::DarkGray,
        NodeStatus::Running => Color::Yellow,
        NodeStatus::Success => Color::Green,
        NodeStatus::Failed => Color::Red,
    }
}

fn execution_status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Running => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
    }
}

fn local_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "\u{2014}".to_string())
}

fn draw_header(f: &mut Frame, state: &AppState, area: Rect, spinner_frame: u8) {
    let activity = if state.connection_status() == ConnectionStatus::Connected {
        let ch = SPINNER_FRAMES[(spinner_frame as usize) % SPINNER_FRAMES.len()];
        Span::styled(format!(" {} LIVE", ch), Style::default().fg(Color::Cyan))
    } else if state.degraded() {
        Span::styled(
            " POLLING (push channel down)",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )
    } else {
        Span::raw("")
    };

    let watching = state
        .runs
        .connected_execution_id
        .as_deref()
        .unwrap_or("\u{2014}");

    let mut lines = vec![Line::from(vec![
        Span::raw(format!(" User: {} | Push: ", state.user_id)),
        connection_span(state.connection_status()),
        Span::raw(format!(" | Watching: {} | Up: {}", watching, state.uptime())),
        activity,
    ])];

    let error = state
        .runs
        .error
        .as_ref()
        .or(state.timeline.error.as_ref())
        .or(state.content.as_ref().and_then(|c| c.error.as_ref()));
    if let Some(error) = error {
        let max = area.width.saturating_sub(4) as usize;
        lines.push(Line::from(Span::styled(
            format!(" {}", truncate_with_ellipsis(error, max)),
            Style::default().fg(Color::Red),
        )));
    } else if let Some(status) = state.content.as_ref().and_then(|c| c.status.as_ref()) {
        lines.push(Line::from(vec![
            Span::raw(format!(" Content {}: ", status.content_id)),
            Span::styled(
                status.status.to_string(),
                Style::default().fg(run_status_color(&status.status)),
            ),
            Span::raw(format!(
                " | {}/{} nodes | current: {}",
                status.completed_nodes,
                status.total_nodes,
                status.current_node.as_deref().unwrap_or("\u{2014}"),
            )),
        ]));
    }

    let title = match &state.content {
        Some(_) => " Execution Sync [content] ",
        None => " Execution Sync ",
    };
    let block = Block::default().title(title).borders(Borders::ALL);
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_runs(f: &mut Frame, state: &AppState, area: Rect) {
    let runs = &state.runs.runs;
    if runs.is_empty() {
        let text = if state.runs.loading {
            "Loading runs..."
        } else {
            "No workflow runs"
        };
        let para = Paragraph::new(Line::from(Span::styled(text, Style::default().fg(Color::DarkGray))))
            .alignment(Alignment::Center)
            .block(Block::default().title(" Runs ").borders(Borders::ALL));
        f.render_widget(para, area);
        return;
    }

    let inner_width = area.width.saturating_sub(2) as usize;
    // live + status + started + finished
    let fixed = 2 + 10 + 9 + 9;
    let flexible = inner_width.saturating_sub(fixed);
    let run_w = (flexible / 2).max(6);
    let key_w = flexible.saturating_sub(run_w).max(4);

    let header = Row::new(vec!["", "Run", "Workflow", "Status", "Started", "Finished"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let visible_lines = area.height.saturating_sub(3) as usize;
    let offset = state
        .selected_run
        .saturating_sub(visible_lines.saturating_sub(1));

    let rows: Vec<Row> = runs
        .iter()
        .enumerate()
        .skip(offset)
        .take(visible_lines)
        .map(|(i, run)| {
            let live = if run.is_live {
                Cell::from("\u{25cf}").style(Style::default().fg(Color::Cyan))
            } else {
                Cell::from(" ")
            };
            let row = Row::new(vec![
                live,
                Cell::from(truncate_with_ellipsis(&run.run_id, run_w).into_owned()),
                Cell::from(truncate_with_ellipsis(&run.workflow_key, key_w).into_owned()),
                Cell::from(run.status.to_string())
                    .style(Style::default().fg(run_status_color(&run.status))),
                Cell::from(local_time(run.started_at)),
                Cell::from(local_time(run.finished_at)),
            ]);
            if i == state.selected_run {
                row.style(Style::default().add_modifier(Modifier::REVERSED))
            } else {
                row
            }
        })
        .collect();

    let constraints = [
        Constraint::Length(2),
        Constraint::Length(run_w as u16),
        Constraint::Length(key_w as u16),
        Constraint::Length(10),
        Constraint::Length(9),
        Constraint::Length(9),
    ];
    let title = format!(" Runs [{}/{}] ", state.selected_run + 1, runs.len());
    let table = Table::new(rows, constraints)
        .header(header)
        .block(Block::default().title(title).borders(Borders::ALL));
    f.render_widget(table, area);
}

fn draw_timeline(f: &mut Frame, state: &AppState, area: Rect) {
    let (title, nodes): (String, &[NodeUpdate]) = match &state.timeline.selected {
        Some(exec) => (
            format!(
                " Timeline {} [{}] ({} in history) ",
                exec.execution_id,
                exec.status.as_str(),
                state.timeline.executions.len()
            ),
            exec.nodes.as_slice(),
        ),
        None => match &state.content {
            Some(content) => (" Timeline (latest run) ".to_string(), content.nodes.as_slice()),
            None => (" Timeline ".to_string(), &[][..]),
        },
    };

    let title_style = match &state.timeline.selected {
        Some(exec) => Style::default().fg(execution_status_color(exec.status)),
        None => Style::default(),
    };
    let block = Block::default()
        .title(Span::styled(title, title_style))
        .borders(Borders::ALL);

    if nodes.is_empty() {
        let para = Paragraph::new(Line::from(Span::styled(
            "No node updates yet",
            Style::default().fg(Color::DarkGray),
        )))
        .alignment(Alignment::Center)
        .block(block);
        f.render_widget(para, area);
        return;
    }

    let inner_width = area.width.saturating_sub(2) as usize;
    let fixed = 9 + 12 + 9 + 6;
    let name_w = inner_width.saturating_sub(fixed).max(4);

    let header = Row::new(vec!["Time", "Node", "Type", "Status", "Mode"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    // Newest nodes at the bottom; keep the tail visible.
    let visible_lines = area.height.saturating_sub(3) as usize;
    let skip = nodes.len().saturating_sub(visible_lines);
    let rows: Vec<Row> = nodes
        .iter()
        .skip(skip)
        .map(|n| {
            Row::new(vec![
                Cell::from(local_time(Some(n.timestamp))),
                Cell::from(truncate_with_ellipsis(&n.node_name, name_w).into_owned()),
                Cell::from(truncate_with_ellipsis(&n.node_type, 12).into_owned()),
                Cell::from(n.status.as_str()).style(Style::default().fg(node_status_color(n.status))),
                Cell::from(format!("{:?}", n.mode).to_lowercase())
                    .style(Style::default().fg(Color::DarkGray)),
            ])
        })
        .collect();

    let constraints = [
        Constraint::Length(9),
        Constraint::Length(name_w as u16),
        Constraint::Length(12),
        Constraint::Length(9),
        Constraint::Length(6),
    ];
    let table = Table::new(rows, constraints).header(header).block(block);
    f.render_widget(table, area);
}

fn draw_logs(f: &mut Frame, state: &AppState, area: Rect) {
    let max_width = area.width.saturating_sub(2) as usize; // borders
    let visible_lines = area.height.saturating_sub(2) as usize;

    let lines: Vec<Line> = state
        .logs
        .iter()
        .rev()
        .take(visible_lines)
        .map(|l| {
            let color = match l.level.as_str() {
                "ERROR" => Color::Red,
                "WARN" => Color::Yellow,
                "SYNC" => Color::Cyan,
                _ => Color::DarkGray,
            };
            let prefix = format!(" {} [{}] ", l.time, l.level);
            let msg_max = max_width.saturating_sub(prefix.len());
            let msg = truncate_with_ellipsis(&l.message, msg_max);
            Line::from(vec![
                Span::styled(prefix, Style::default().fg(color)),
                Span::raw(msg.into_owned()),
            ])
        })
        .collect();

    let block = Block::default().title(" Log ").borders(Borders::ALL);
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn draw_footer(f: &mut Frame, area: Rect) {
    let key = |k: &'static str| Span::styled(k, Style::default().fg(Color::Yellow));
    let line = Line::from(vec![
        key("  [q]"),
        Span::raw("uit  "),
        key("[r]"),
        Span::raw("efresh  "),
        key("[j/k]"),
        Span::raw(" select  "),
        key("[Enter]"),
        Span::raw(" watch  "),
        key("[d]"),
        Span::raw("isconnect  "),
        key("[c]"),
        Span::raw("lear history  "),
    ]);
    f.render_widget(Paragraph::new(line), area);
}

fn truncate_with_ellipsis(s: &str, max_width: usize) -> Cow<'_, str> {
    let char_count = s.chars().count();
    if char_count <= max_width {
        Cow::Borrowed(s)
    } else if max_width <= 3 {
        Cow::Owned(".".repeat(max_width))
    } else {
        let end = s
            .char_indices()
            .nth(max_width - 3)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        Cow::Owned(format!("{}...", &s[..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::RunListState;
    use crate::model::WorkflowRun;
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate_with_ellipsis("hello world", 8), "hello...");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 2), "..");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_with_ellipsis("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_local_time_placeholder() {
        assert_eq!(local_time(None), "\u{2014}");
    }

    #[test]
    fn test_draw_renders_runs_and_footer() {
        let mut state = AppState::new("user-1");
        state.set_runs(RunListState {
            runs: vec![WorkflowRun {
                id: Some(1),
                run_id: "run-abc".to_string(),
                workflow_key: "publish".to_string(),
                status: RunStatus::Running,
                started_at: None,
                finished_at: None,
                output: None,
                content_id: None,
                is_live: true,
                last_updated: None,
            }],
            ..Default::default()
        });
        state.push_log("SYNC", "watching run-abc".to_string());

        let mut terminal = Terminal::new(TestBackend::new(100, 40)).unwrap();
        terminal.draw(|f| draw(f, &state, 0)).unwrap();
        let buffer = terminal.backend().buffer();
        let text: String = buffer.content().iter().map(|c| c.symbol()).collect();
        assert!(text.contains("run-abc"));
        assert!(text.contains("RUNNING"));
        assert!(text.contains("[q]"));
    }
}
