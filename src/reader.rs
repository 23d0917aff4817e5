//! Incremental subprocess output reader with bounded waits.
//!
//! Bytes are read one at a time through a ~100ms bounded wait so the shared
//! cancellation flag is re-checked every cycle even when no data arrives.
//! Completed lines are dispatched to the output callback and the circuit
//! breaker; in JSON mode the stream-json protocol is decoded first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::POLL_INTERVAL_MS;
use crate::breaker::CircuitBreaker;
use crate::stream::{CONTROL_LINE_TOKEN, ParsedLine, StreamParser, TokenUsage};

/// Flags shared between the coordination loop and the reader tasks for one
/// execution attempt. `cancel` is set-once; everything polls it.
#[derive(Debug, Default)]
pub struct RunFlags {
    pub cancel: AtomicBool,
    pub process_exited: AtomicBool,
    pub breaker_tripped: AtomicBool,
}

impl RunFlags {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

pub type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything a finished reader hands back to the runner.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub lines: Vec<String>,
    pub token_usage: TokenUsage,
    pub total_cost: f64,
}

pub struct StreamReader {
    flags: Arc<RunFlags>,
    breaker: Option<Arc<CircuitBreaker>>,
    on_output: Option<OutputHook>,
    parser: Option<StreamParser>,
    /// Only the primary (stdout) reader evaluates inactivity; a secondary
    /// stderr reader just records what it sees.
    drives_inactivity: bool,
}

impl StreamReader {
    /// Reader for the protocol stream (stdout, JSON mode).
    pub fn json(
        flags: Arc<RunFlags>,
        breaker: Option<Arc<CircuitBreaker>>,
        on_output: Option<OutputHook>,
        parser: StreamParser,
    ) -> Self {
        Self {
            flags,
            breaker,
            on_output,
            parser: Some(parser),
            drives_inactivity: true,
        }
    }

    /// Raw-mode reader forwarding lines verbatim.
    pub fn raw(
        flags: Arc<RunFlags>,
        breaker: Option<Arc<CircuitBreaker>>,
        on_output: Option<OutputHook>,
    ) -> Self {
        Self {
            flags,
            breaker,
            on_output,
            parser: None,
            drives_inactivity: true,
        }
    }

    /// Secondary reader (stderr): records output into the breaker but never
    /// drives inactivity checks.
    pub fn secondary(
        flags: Arc<RunFlags>,
        breaker: Option<Arc<CircuitBreaker>>,
        on_output: Option<OutputHook>,
    ) -> Self {
        Self {
            flags,
            breaker,
            on_output,
            parser: None,
            drives_inactivity: false,
        }
    }

    /// Drain the stream until EOF, cancellation, or a breaker trip.
    ///
    /// A trailing partial line (no final newline) is flushed only when
    /// cancellation did not occur mid-read; a cancelled read discards it.
    pub async fn read<R>(mut self, mut stream: R) -> ReadOutcome
    where
        R: AsyncRead + Unpin,
    {
        let mut outcome = ReadOutcome::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        let poll = Duration::from_millis(POLL_INTERVAL_MS);

        while !self.flags.cancelled() {
            match tokio::time::timeout(poll, stream.read(&mut byte)).await {
                Err(_) => {
                    // No data within the bounded wait. A lingering grandchild
                    // can hold the pipe open past the agent's exit, so every
                    // reader stops on the exit flag rather than waiting for
                    // EOF.
                    if self.flags.process_exited.load(Ordering::SeqCst) {
                        break;
                    }
                    if !self.drives_inactivity {
                        continue;
                    }
                    if let Some(breaker) = &self.breaker {
                        if breaker.check_inactivity().is_some() {
                            self.flags.breaker_tripped.store(true, Ordering::SeqCst);
                            self.flags.request_cancel();
                            break;
                        }
                    }
                }
                Ok(Ok(0)) => break, // EOF
                Ok(Ok(_)) => {
                    if byte[0] == b'\n' {
                        let line = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        if self.dispatch(&line, true, &mut outcome.lines) {
                            break;
                        }
                    } else {
                        buffer.push(byte[0]);
                    }
                }
                // Draining a closing pipe: treat read errors as end of stream.
                Ok(Err(_)) => break,
            }
        }

        if !buffer.is_empty() && !self.flags.cancelled() {
            let line = String::from_utf8_lossy(&buffer).into_owned();
            self.dispatch(&line, false, &mut outcome.lines);
        }

        if let Some(parser) = &self.parser {
            outcome.token_usage = parser.token_usage().clone();
            outcome.total_cost = parser.total_cost();
        }
        outcome
    }

    /// Dispatch one completed line. Returns true when the breaker tripped
    /// and the read loop should stop.
    fn dispatch(&mut self, line: &str, had_newline: bool, lines: &mut Vec<String>) -> bool {
        let terminator = if had_newline { "\n" } else { "" };
        match &mut self.parser {
            Some(parser) => match parser.parse_line(line) {
                None => false,
                Some(ParsedLine::Text(text)) => {
                    lines.push(format!("{text}{terminator}"));
                    if let Some(hook) = &self.on_output {
                        hook(&text);
                    }
                    self.record(&text)
                }
                // Valid protocol line with no visible text: still activity.
                Some(ParsedLine::Control) => self.record(CONTROL_LINE_TOKEN),
            },
            None => {
                lines.push(format!("{line}{terminator}"));
                if let Some(hook) = &self.on_output {
                    hook(line);
                }
                self.record(line)
            }
        }
    }

    fn record(&self, text: &str) -> bool {
        let Some(breaker) = &self.breaker else {
            return false;
        };
        if breaker.record_output(text).is_some() {
            self.flags.breaker_tripped.store(true, Ordering::SeqCst);
            self.flags.request_cancel();
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerContext, TriggerKind};
    use crate::config::BreakerConfig;
    use crate::state::Phase;
    use std::sync::Mutex;

    fn flags() -> Arc<RunFlags> {
        Arc::new(RunFlags::default())
    }

    #[tokio::test]
    async fn raw_mode_collects_lines_verbatim() {
        let reader = StreamReader::raw(flags(), None, None);
        let outcome = reader.read(&b"alpha\nbeta\n"[..]).await;
        assert_eq!(outcome.lines, vec!["alpha\n", "beta\n"]);
    }

    #[tokio::test]
    async fn partial_final_line_is_flushed_without_cancellation() {
        let reader = StreamReader::raw(flags(), None, None);
        let outcome = reader.read(&b"alpha\ntail-without-newline"[..]).await;
        assert_eq!(outcome.lines, vec!["alpha\n", "tail-without-newline"]);
    }

    #[tokio::test]
    async fn partial_final_line_is_discarded_on_cancellation() {
        let run_flags = flags();
        run_flags.request_cancel();
        let reader = StreamReader::raw(Arc::clone(&run_flags), None, None);
        let outcome = reader.read(&b"tail-without-newline"[..]).await;
        assert!(outcome.lines.is_empty());
    }

    #[tokio::test]
    async fn output_hook_sees_each_line() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_ref = Arc::clone(&seen);
        let hook: OutputHook = Arc::new(move |line: &str| {
            seen_ref.lock().unwrap().push(line.to_string());
        });
        let reader = StreamReader::raw(flags(), None, Some(hook));
        reader.read(&b"one\ntwo\n"[..]).await;
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn json_mode_extracts_text_and_skips_control_output() {
        let input = concat!(
            r#"{"type":"system","subtype":"init"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}"#,
            "\n",
        );
        let reader = StreamReader::json(flags(), None, None, StreamParser::default());
        let outcome = reader.read(input.as_bytes()).await;
        assert_eq!(outcome.lines, vec!["hello\n"]);
    }

    #[tokio::test]
    async fn json_mode_accumulates_usage() {
        let input = concat!(
            r#"{"type":"result","usage":{"input_tokens":11,"output_tokens":7},"total_cost_usd":0.02}"#,
            "\n",
        );
        let reader = StreamReader::json(flags(), None, None, StreamParser::default());
        let outcome = reader.read(input.as_bytes()).await;
        assert_eq!(outcome.token_usage.input_tokens, 11);
        assert_eq!(outcome.token_usage.output_tokens, 7);
        assert!((outcome.total_cost - 0.02).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn control_lines_count_as_breaker_activity() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig::default(),
            BreakerContext::new(Phase::Specification),
        ));
        let input = concat!(r#"{"type":"system","subtype":"init"}"#, "\n");
        let reader = StreamReader::json(
            flags(),
            Some(Arc::clone(&breaker)),
            None,
            StreamParser::default(),
        );
        reader.read(input.as_bytes()).await;
        // One recorded line: the control placeholder.
        assert_eq!(breaker.attempts(), 0);
        assert!(breaker.check_inactivity().is_none());
    }

    #[tokio::test]
    async fn breaker_trip_stops_reading_and_sets_flags() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                max_output_size: 4,
                max_attempts: 1,
                ..Default::default()
            },
            BreakerContext::new(Phase::Specification),
        ));
        let run_flags = flags();
        let reader = StreamReader::raw(Arc::clone(&run_flags), Some(breaker), None);
        let outcome = reader.read(&b"overflowing line\nnever-read\n"[..]).await;

        assert_eq!(outcome.lines.len(), 1);
        assert!(run_flags.cancelled());
        assert!(run_flags.breaker_tripped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inactivity_trip_aborts_idle_stream() {
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                inactivity_timeout: 0,
                max_attempts: 1,
                ..Default::default()
            },
            BreakerContext::new(Phase::Specification),
        ));
        let run_flags = flags();
        // A duplex stream that never produces data keeps the reader in its
        // bounded-wait path.
        let (_writer, read_half) = tokio::io::duplex(16);
        let reader = StreamReader::raw(Arc::clone(&run_flags), Some(breaker.clone()), None);

        let outcome = tokio::time::timeout(Duration::from_secs(2), reader.read(read_half))
            .await
            .expect("reader should abort on inactivity trip");
        assert!(outcome.lines.is_empty());
        assert!(run_flags.breaker_tripped.load(Ordering::SeqCst));
        assert_eq!(breaker.last_trigger(), Some(TriggerKind::Inactivity));
    }

    #[tokio::test]
    async fn reader_stops_when_process_exited_and_stream_is_idle() {
        let run_flags = flags();
        run_flags.process_exited.store(true, Ordering::SeqCst);
        let (_writer, read_half) = tokio::io::duplex(16);
        let reader = StreamReader::raw(Arc::clone(&run_flags), None, None);
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader.read(read_half))
            .await
            .expect("reader should stop once process exit is flagged");
        assert!(outcome.lines.is_empty());
    }

    #[tokio::test]
    async fn secondary_reader_stops_when_process_exited() {
        let run_flags = flags();
        run_flags.process_exited.store(true, Ordering::SeqCst);
        // The open write half stands in for a grandchild still holding the
        // pipe; no EOF ever arrives.
        let (_writer, read_half) = tokio::io::duplex(16);
        let reader = StreamReader::secondary(Arc::clone(&run_flags), None, None);
        let outcome = tokio::time::timeout(Duration::from_secs(2), reader.read(read_half))
            .await
            .expect("stderr reader should stop once process exit is flagged");
        assert!(outcome.lines.is_empty());
    }
}
