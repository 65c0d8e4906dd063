use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use cozylife_core::{CoordinatorStatus, DeviceSnapshot, PollingCoordinator, SwitchDriver};
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph};
use ratatui::{Frame, Terminal};

struct Metric {
    title: &'static str,
    unit: &'static str,
    color: Color,
    read: fn(&DeviceSnapshot) -> f64,
    non_negative: bool,
}

static METRICS: [Metric; 3] = [
    Metric {
        title: "Power",
        unit: "W",
        color: Color::Yellow,
        read: power,
        non_negative: true,
    },
    Metric {
        title: "Current",
        unit: "A",
        color: Color::Cyan,
        read: current,
        non_negative: true,
    },
    Metric {
        title: "Voltage",
        unit: "V",
        color: Color::Green,
        read: voltage,
        non_negative: false,
    },
];

fn power(snapshot: &DeviceSnapshot) -> f64 {
    snapshot.power
}

fn current(snapshot: &DeviceSnapshot) -> f64 {
    snapshot.current
}

fn voltage(snapshot: &DeviceSnapshot) -> f64 {
    snapshot.voltage
}

enum KeyAction {
    Quit,
    Switch(bool),
    Refresh,
    Ignore,
}

impl From<KeyCode> for KeyAction {
    fn from(code: KeyCode) -> Self {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => Self::Quit,
            KeyCode::Char('1') => Self::Switch(true),
            KeyCode::Char('0') => Self::Switch(false),
            KeyCode::Char('r') => Self::Refresh,
            _ => Self::Ignore,
        }
    }
}

struct Trend {
    metric: &'static Metric,
    samples: VecDeque<(f64, f64)>,
}

impl Trend {
    fn new(metric: &'static Metric) -> Self {
        Self {
            metric,
            samples: VecDeque::new(),
        }
    }

    fn record(&mut self, at: f64, value: f64, window_sec: f64) {
        self.samples.push_back((at, value));
        let cutoff = at - window_sec;
        while self.samples.front().is_some_and(|(t, _)| *t < cutoff) {
            self.samples.pop_front();
        }
    }

    fn value_range(&self) -> [f64; 2] {
        let (low, high) = self
            .samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), (_, v)| {
                (low.min(*v), high.max(*v))
            });
        if low > high {
            return [0.0, 1.0];
        }
        let margin = ((high - low) * 0.1).max(1.0);
        let floor = low - margin;
        let floor = if self.metric.non_negative { floor.max(0.0) } else { floor };
        [floor, high + margin]
    }

    // x is seconds relative to `now`, so the newest sample sits at 0.
    fn relative_points(&self, now: f64) -> Vec<(f64, f64)> {
        self.samples.iter().map(|(t, v)| (t - now, *v)).collect()
    }
}

struct Dashboard {
    started: Instant,
    window_sec: f64,
    status: Option<CoordinatorStatus>,
    plotted: Option<DateTime<Utc>>,
    trends: Vec<Trend>,
}

impl Dashboard {
    fn new(window_sec: f64) -> Self {
        Self {
            started: Instant::now(),
            window_sec,
            status: None,
            plotted: None,
            trends: METRICS.iter().map(Trend::new).collect(),
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    // A retained snapshot is not a new sample.
    fn observe(&mut self, status: CoordinatorStatus) {
        let at = self.elapsed();
        if let Some(snapshot) = status.snapshot.as_ref().filter(|s| self.plotted != Some(s.ts)) {
            for trend in &mut self.trends {
                let value = (trend.metric.read)(snapshot);
                trend.record(at, value, self.window_sec);
            }
            self.plotted = Some(snapshot.ts);
        }
        self.status = Some(status);
    }
}

pub async fn run_viewer<D: SwitchDriver>(
    coordinator: &PollingCoordinator<D>,
    window_sec: f64,
) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut dashboard = Dashboard::new(window_sec);
    let poll_interval = coordinator.config().poll_interval;
    let mut due = Instant::now();

    let outcome = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match KeyAction::from(key.code) {
                        KeyAction::Quit => return Ok::<(), anyhow::Error>(()),
                        KeyAction::Switch(on) => {
                            coordinator.set_power(on).await;
                            dashboard.observe(coordinator.status());
                        }
                        KeyAction::Refresh => due = Instant::now(),
                        KeyAction::Ignore => {}
                    }
                }
            }

            if Instant::now() >= due {
                let _ = coordinator.refresh().await;
                dashboard.observe(coordinator.status());
                due = Instant::now() + poll_interval;
            }

            terminal.draw(|frame| draw(frame, &dashboard))?;
        }
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    outcome
}

fn draw(frame: &mut Frame<'_>, dashboard: &Dashboard) {
    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(frame.size());
    frame.render_widget(status_panel(dashboard), sections[0]);

    let share = dashboard.trends.len() as u32;
    let slots = Layout::default()
        .direction(Direction::Vertical)
        .constraints(dashboard.trends.iter().map(|_| Constraint::Ratio(1, share)))
        .split(sections[1]);

    let now = dashboard.elapsed();
    for (trend, slot) in dashboard.trends.iter().zip(slots.iter()) {
        let points = trend.relative_points(now);
        frame.render_widget(trend_chart(trend, &points, dashboard.window_sec), *slot);
    }
}

fn status_panel(dashboard: &Dashboard) -> Paragraph<'static> {
    let Some(status) = &dashboard.status else {
        return Paragraph::new("Waiting for first poll...")
            .block(Block::default().borders(Borders::ALL).title("Plug"));
    };

    let (label, color) = if status.available {
        ("online", Color::Green)
    } else {
        ("unavailable", Color::Red)
    };
    let reading = match &status.snapshot {
        Some(snapshot) => format!(
            "relay {}  {:.1} W  {:.3} A  {:.1} V",
            if snapshot.on { "ON" } else { "OFF" },
            snapshot.power,
            snapshot.current,
            snapshot.voltage,
        ),
        None => "no reading yet".to_string(),
    };
    let health = format!(
        "failures {}/{}  ok {}  err {}  skipped {}  {}",
        status.consecutive_failures,
        status.failure_threshold,
        status.quality.polls_ok,
        status.quality.polls_err,
        status.quality.polls_skipped,
        status.last_error.as_deref().unwrap_or(""),
    );

    Paragraph::new(vec![
        Line::from(vec![
            Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
            Span::raw("  "),
            Span::raw(reading),
        ]),
        Line::from(health),
    ])
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("{}  [1 on | 0 off | r refresh | q quit]", status.device)),
    )
}

fn trend_chart<'a>(trend: &Trend, points: &'a [(f64, f64)], window_sec: f64) -> Chart<'a> {
    let [low, high] = trend.value_range();
    let axis_style = Style::default().fg(Color::DarkGray);

    let dataset = Dataset::default()
        .marker(Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(trend.metric.color))
        .data(points);

    Chart::new(vec![dataset])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("{} ({})", trend.metric.title, trend.metric.unit)),
        )
        .x_axis(
            Axis::default()
                .style(axis_style)
                .bounds([-window_sec, 0.0])
                .labels(vec![
                    Span::raw(format!("-{window_sec:.0}s")),
                    Span::raw(format!("-{:.0}s", window_sec / 2.0)),
                    Span::raw("now"),
                ]),
        )
        .y_axis(
            Axis::default()
                .style(axis_style)
                .bounds([low, high])
                .labels(vec![Span::raw(format!("{low:.1}")), Span::raw(format!("{high:.1}"))]),
        )
}
