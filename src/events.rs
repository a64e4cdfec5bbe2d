// src/events.rs
//
// Outbound event queue between the session workers and the display.
// Producers never block. The consumer drains on a fixed tick and forwards
// events to the display sink in enqueue order.
//
// The queue is unbounded: if the consumer stalls, memory grows with the
// device's output rate. `EventConsumer::backlog` exposes the current depth.

use std::time::Duration;

use tokio::sync::mpsc;

/// Default consumer tick.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// Subsystem tags recognised in device output, in priority order.
const LINE_TAGS: [LineTag; 6] = [
    LineTag::Ais,
    LineTag::Cvp,
    LineTag::Can,
    LineTag::Net,
    LineTag::Pla,
    LineTag::Fot,
];

/// Device subsystem a line belongs to, used for display colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Ais,
    Cvp,
    Can,
    Net,
    Pla,
    Fot,
}

impl LineTag {
    pub fn keyword(self) -> &'static str {
        match self {
            LineTag::Ais => "AIS",
            LineTag::Cvp => "CVP",
            LineTag::Can => "CAN",
            LineTag::Net => "NET",
            LineTag::Pla => "PLA",
            LineTag::Fot => "FOT",
        }
    }

    /// First tag whose keyword appears in `text`.
    pub fn detect(text: &str) -> Option<LineTag> {
        LINE_TAGS.into_iter().find(|t| text.contains(t.keyword()))
    }
}

/// A display-ready unit.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    Line(String),
    Status {
        connected: bool,
        port: Option<String>,
    },
}

/// Display collaborator. Called only from the consumer loop.
pub trait DisplaySink: Send {
    fn on_line(&mut self, text: &str);
    fn on_status(&mut self, connected: bool, port_name: Option<&str>);
}

/// Producer handle. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<DisplayEvent>,
}

/// Single consumer end of the queue.
pub struct EventConsumer {
    rx: mpsc::UnboundedReceiver<DisplayEvent>,
}

/// Create a connected producer/consumer pair.
pub fn event_queue() -> (EventQueue, EventConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventQueue { tx }, EventConsumer { rx })
}

impl EventQueue {
    pub fn push(&self, event: DisplayEvent) {
        // Consumer gone means the process is shutting down
        let _ = self.tx.send(event);
    }

    pub fn push_line(&self, text: impl Into<String>) {
        self.push(DisplayEvent::Line(text.into()));
    }

    pub fn push_status(&self, connected: bool, port: Option<&str>) {
        self.push(DisplayEvent::Status {
            connected,
            port: port.map(str::to_string),
        });
    }
}

impl EventConsumer {
    /// Forward every queued event to `sink`. Returns how many were forwarded.
    pub fn drain_into(&mut self, sink: &mut dyn DisplaySink) -> usize {
        let mut forwarded = 0;
        while let Ok(event) = self.rx.try_recv() {
            match event {
                DisplayEvent::Line(text) => sink.on_line(&text),
                DisplayEvent::Status { connected, port } => {
                    sink.on_status(connected, port.as_deref())
                }
            }
            forwarded += 1;
        }
        forwarded
    }

    /// Events waiting to be drained.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }

    /// Drain on a fixed tick until every producer is dropped.
    pub async fn run(mut self, mut sink: Box<dyn DisplaySink>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.drain_into(sink.as_mut());
            if self.rx.is_closed() && self.rx.is_empty() {
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records everything it is given.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub events: Arc<Mutex<Vec<DisplayEvent>>>,
    }

    impl RecordingSink {
        pub fn lines(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    DisplayEvent::Line(l) => Some(l.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl DisplaySink for RecordingSink {
        fn on_line(&mut self, text: &str) {
            self.events.lock().unwrap().push(DisplayEvent::Line(text.to_string()));
        }

        fn on_status(&mut self, connected: bool, port_name: Option<&str>) {
            self.events.lock().unwrap().push(DisplayEvent::Status {
                connected,
                port: port_name.map(str::to_string),
            });
        }
    }

    #[test]
    fn test_drain_preserves_order_across_threads() {
        let (queue, mut consumer) = event_queue();
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..100 {
                    queue.push_line(format!("reader {}", i));
                }
            })
        };
        producer.join().unwrap();
        queue.push_status(true, Some("/dev/ttyUSB0"));

        assert_eq!(consumer.backlog(), 101);
        let mut sink = RecordingSink::default();
        assert_eq!(consumer.drain_into(&mut sink), 101);

        let lines = sink.lines();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0], "reader 0");
        assert_eq!(lines[99], "reader 99");
        assert_eq!(
            sink.events.lock().unwrap().last(),
            Some(&DisplayEvent::Status {
                connected: true,
                port: Some("/dev/ttyUSB0".to_string())
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_producers_drop() {
        let (queue, consumer) = event_queue();
        let sink = RecordingSink::default();
        let handle = tokio::spawn(consumer.run(Box::new(sink.clone()), DEFAULT_DRAIN_INTERVAL));

        queue.push_line("one");
        queue.push_line("two");
        drop(queue);

        handle.await.unwrap();
        assert_eq!(sink.lines(), vec!["one", "two"]);
    }

    #[test]
    fn test_line_tags() {
        assert_eq!(LineTag::detect("[NET] attach ok"), Some(LineTag::Net));
        assert_eq!(LineTag::detect("AIS CAN both"), Some(LineTag::Ais));
        assert_eq!(LineTag::detect("plain"), None);
    }
}
