//! Publish progress consumer.
//!
//! The publish endpoint streams newline-delimited JSON progress records:
//!
//! ```text
//! {"step":"starting","message":"Preparing"}
//! {"step":"images","current":1,"total":4}
//! {"current":2}
//! {"step":"deploy"}
//! {"step":"upload"}
//! {"step":"done","url":"https://pages.example.com/es/landing"}
//! ```
//!
//! Records are partial updates: a field that is absent leaves the local
//! state untouched. Stages only move forward
//! (`starting → images → deploy → upload → done`), `error` can interrupt any
//! non-terminal stage, and nothing changes once `done` or `error` is reached.
//!
//! [`PublishRun`] is the pure state machine and can be driven by any line
//! iterator. [`PublishConsumer`] adapts it to the network byte stream.

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::service::{call_guarded, TranslationService};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStage {
    Starting,
    Images,
    Deploy,
    Upload,
    Done,
    Error,
}

impl PublishStage {
    pub fn parse(step: &str) -> Option<Self> {
        match step {
            "starting" => Some(PublishStage::Starting),
            "images" => Some(PublishStage::Images),
            "deploy" => Some(PublishStage::Deploy),
            "upload" => Some(PublishStage::Upload),
            "done" => Some(PublishStage::Done),
            "error" => Some(PublishStage::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PublishStage::Done | PublishStage::Error)
    }

    /// Position on the forward path. `Error` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            PublishStage::Starting => Some(0),
            PublishStage::Images => Some(1),
            PublishStage::Deploy => Some(2),
            PublishStage::Upload => Some(3),
            PublishStage::Done => Some(4),
            PublishStage::Error => None,
        }
    }
}

/// One progress record off the wire. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressRecord {
    pub step: Option<String>,
    pub current: Option<u64>,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub url: Option<String>,
    /// Some servers report failures as `{"step":"error","error":"..."}`.
    pub error: Option<String>,
}

/// State of one streaming publish request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishRun {
    pub stage: PublishStage,
    pub current: u64,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub published_url: Option<String>,
    pub error_message: Option<String>,
}

impl Default for PublishRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishRun {
    pub fn new() -> Self {
        Self {
            stage: PublishStage::Starting,
            current: 0,
            total: None,
            message: None,
            published_url: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Apply one record. Returns whether anything changed.
    pub fn apply(&mut self, record: &ProgressRecord) -> bool {
        if self.is_terminal() {
            return false;
        }
        let before = self.clone();

        if let Some(total) = record.total {
            self.total = Some(total);
        }
        if let Some(current) = record.current {
            self.current = current;
        }
        if let Some(total) = self.total {
            self.current = self.current.min(total);
        }
        if let Some(message) = &record.message {
            self.message = Some(message.clone());
        }
        if let Some(url) = &record.url {
            self.published_url = Some(url.clone());
        }

        match record.step.as_deref().map(|s| (s, PublishStage::parse(s))) {
            Some((_, Some(PublishStage::Error))) => {
                self.stage = PublishStage::Error;
                self.error_message = Some(
                    record
                        .error
                        .clone()
                        .or_else(|| record.message.clone())
                        .unwrap_or_else(|| "Publish failed".to_string()),
                );
            }
            Some((_, Some(next))) => {
                if next.rank() > self.stage.rank() {
                    self.stage = next;
                }
            }
            Some((step, None)) => debug!("Ignoring unknown publish step '{}'", step),
            None => {}
        }

        *self != before
    }

    /// Parse and apply one line. Blank and malformed lines are skipped.
    pub fn apply_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return false;
        }
        match serde_json::from_str::<ProgressRecord>(line) {
            Ok(record) => self.apply(&record),
            Err(e) => {
                debug!("Skipping malformed publish record ({}): {}", e, line);
                false
            }
        }
    }

    /// Pull lines until a terminal stage is reached or the lines run out.
    /// A source that runs dry before a terminal record fails the run.
    pub fn consume<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            self.apply_line(line.as_ref());
            if self.is_terminal() {
                return;
            }
        }
        self.fail(ENDED_EARLY);
    }

    /// Move to `error` unless already terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.stage = PublishStage::Error;
        self.error_message = Some(message.into());
    }
}

const ENDED_EARLY: &str = "Publish ended before completion";

/// Longest progress record accepted, newline excluded.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// A record grew past the limit without a newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Publish record too large")]
pub struct RecordTooLarge;

/// Reassembles lines from arbitrarily chunked bytes.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    /// Bytes of `pending` already known to hold no newline.
    scanned: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_RECORD_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            limit,
        }
    }

    /// Append a chunk and drain every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, RecordTooLarge> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if end - start > self.limit {
                return Err(RecordTooLarge);
            }
            let line = String::from_utf8_lossy(&self.pending[start..end]);
            let line = line.trim_end_matches('\r');
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
            start = end + 1;
            self.scanned = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();
        if self.pending.len() > self.limit {
            return Err(RecordTooLarge);
        }
        Ok(lines)
    }

    /// Whatever is left once the stream closes.
    pub fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

/// Result of asking a consumer to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishStart {
    /// The request ran to a terminal stage (`done` or `error`).
    Finished(PublishRun),
    /// A request was already issued in this lifecycle; nothing was sent.
    AlreadyStarted,
}

/// Consumes one streaming publish request.
///
/// A consumer issues at most one request over its lifetime. Open a new
/// consumer for the next publish.
pub struct PublishConsumer {
    service: Arc<dyn TranslationService>,
    started: AtomicBool,
    progress: watch::Sender<PublishRun>,
}

impl PublishConsumer {
    pub fn new(service: Arc<dyn TranslationService>) -> Self {
        let (progress, _) = watch::channel(PublishRun::new());
        Self {
            service,
            started: AtomicBool::new(false),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishRun> {
        self.progress.subscribe()
    }

    pub fn snapshot(&self) -> PublishRun {
        self.progress.borrow().clone()
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Publish `translation_id` and follow its progress to a terminal stage.
    ///
    /// Returns `Err(Cancelled)` when `cancel` fires; the stream is dropped and
    /// no failure is recorded.
    pub async fn start(
        &self,
        translation_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<PublishStart> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Publish for {} already started, ignoring", translation_id);
            return Ok(PublishStart::AlreadyStarted);
        }

        let metrics = PipelineMetrics::global();
        metrics.record_publish_run();
        info!("Publishing {}", translation_id);

        let run = self.follow(translation_id, cancel).await?;
        if run.stage == PublishStage::Error {
            metrics.record_publish_failure();
            warn!(
                "Publish of {} failed: {}",
                translation_id,
                run.error_message.as_deref().unwrap_or("unknown error")
            );
        } else {
            info!(
                "Published {} at {}",
                translation_id,
                run.published_url.as_deref().unwrap_or("<no url>")
            );
        }
        Ok(PublishStart::Finished(run))
    }

    async fn follow(
        &self,
        translation_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<PublishRun> {
        let mut run = PublishRun::new();
        self.progress.send_replace(run.clone());

        let mut stream = match call_guarded(cancel, self.service.publish(translation_id)).await {
            Ok(stream) => stream,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(e) => {
                run.fail(e.reason());
                self.progress.send_replace(run.clone());
                return Ok(run);
            }
        };

        let mut buffer = LineBuffer::new();
        while !run.is_terminal() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                chunk = stream.next() => chunk,
            };

            match next {
                Some(Ok(chunk)) => match buffer.push(&chunk) {
                    Ok(lines) => {
                        for line in lines {
                            if run.apply_line(&line) {
                                self.progress.send_replace(run.clone());
                            }
                            if run.is_terminal() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("publish {}: {}", translation_id, e);
                        run.fail(e.to_string());
                        self.progress.send_replace(run.clone());
                    }
                },
                Some(Err(e)) => {
                    run.fail(e.reason());
                    self.progress.send_replace(run.clone());
                }
                None => {
                    let buffer = std::mem::take(&mut buffer);
                    if let Some(line) = buffer.finish() {
                        run.apply_line(&line);
                    }
                    run.fail(ENDED_EARLY);
                    self.progress.send_replace(run.clone());
                }
            }
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{api_error, CallKind, FakeService};
    use proptest::prelude::*;

    fn record(json: &str) -> ProgressRecord {
        serde_json::from_str(json).expect("valid record")
    }

    // ==================== Line Buffer ====================

    #[test]
    fn test_line_buffer_joins_split_records() {
        let mut buffer = LineBuffer::new();

        assert!(buffer.push(br#"{"step":"ima"#).unwrap().is_empty());
        let lines = buffer
            .push(b"ges\",\"total\":3}\n{\"current\":1}\n{\"cur")
            .unwrap();

        assert_eq!(lines, vec![r#"{"step":"images","total":3}"#, r#"{"current":1}"#]);
        assert_eq!(buffer.finish().as_deref(), Some(r#"{"cur"#));
    }

    #[test]
    fn test_line_buffer_handles_split_utf8_and_crlf() {
        let mut buffer = LineBuffer::new();
        let text = "{\"message\":\"Subiendo imágenes\"}\r\n".as_bytes();
        let split = text.iter().position(|b| *b >= 0x80).unwrap() + 1;

        assert!(buffer.push(&text[..split]).unwrap().is_empty());
        let lines = buffer.push(&text[split..]).unwrap();

        assert_eq!(lines, vec!["{\"message\":\"Subiendo imágenes\"}"]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_line_buffer_skips_blank_lines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"\n\n{\"step\":\"deploy\"}\n\n").unwrap();
        assert_eq!(lines, vec![r#"{"step":"deploy"}"#]);
    }

    #[test]
    fn test_line_buffer_assembles_line_from_many_chunks() {
        let mut buffer = LineBuffer::new();
        let line = format!("{{\"message\":\"{}\"}}", "a".repeat(4000));

        for chunk in line.as_bytes().chunks(7) {
            assert!(buffer.push(chunk).unwrap().is_empty());
        }
        let lines = buffer.push(b"\n").unwrap();

        assert_eq!(lines, vec![line]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_line_buffer_rejects_oversized_record() {
        let mut buffer = LineBuffer::with_limit(16);

        assert_eq!(buffer.push(b"{\"step\":\"done\"}\n").unwrap().len(), 1);
        assert!(buffer.push(b"0123456789").unwrap().is_empty());
        assert_eq!(buffer.push(b"0123456789"), Err(RecordTooLarge));

        let mut buffer = LineBuffer::with_limit(16);
        assert_eq!(buffer.push(b"0123456789abcdefXYZ\n"), Err(RecordTooLarge));
    }

    // ==================== State Machine ====================

    #[test]
    fn test_partial_record_does_not_reset_other_fields() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"step":"images","current":1,"total":10,"message":"x"}"#));

        run.apply(&record(r#"{"current":3}"#));

        assert_eq!(run.current, 3);
        assert_eq!(run.total, Some(10));
        assert_eq!(run.message.as_deref(), Some("x"));
        assert_eq!(run.stage, PublishStage::Images);
    }

    #[test]
    fn test_stage_never_moves_backwards() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"step":"deploy"}"#));
        run.apply(&record(r#"{"step":"images","message":"late"}"#));

        assert_eq!(run.stage, PublishStage::Deploy);
        // other fields of the late record still apply
        assert_eq!(run.message.as_deref(), Some("late"));
    }

    #[test]
    fn test_done_is_terminal() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"step":"done","url":"https://pages.test/es"}"#));

        assert!(!run.apply(&record(r#"{"step":"error","message":"late"}"#)));
        assert!(!run.apply(&record(r#"{"current":5}"#)));
        assert_eq!(run.stage, PublishStage::Done);
        assert_eq!(run.published_url.as_deref(), Some("https://pages.test/es"));
        assert!(run.error_message.is_none());
    }

    #[test]
    fn test_error_record_reachable_from_any_stage() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"step":"upload"}"#));
        run.apply(&record(r#"{"step":"error","message":"Bucket quota exceeded"}"#));

        assert_eq!(run.stage, PublishStage::Error);
        assert_eq!(run.error_message.as_deref(), Some("Bucket quota exceeded"));
        assert!(!run.apply(&record(r#"{"step":"done"}"#)));
    }

    #[test]
    fn test_error_record_prefers_error_field() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"step":"error","error":"Deploy hook 502","message":"Deploying"}"#));
        assert_eq!(run.error_message.as_deref(), Some("Deploy hook 502"));
    }

    #[test]
    fn test_current_clamped_to_total() {
        let mut run = PublishRun::new();
        run.apply(&record(r#"{"current":12,"total":10}"#));
        assert_eq!(run.current, 10);
    }

    #[test]
    fn test_malformed_and_unknown_lines_are_skipped() {
        let mut run = PublishRun::new();
        assert!(!run.apply_line("not json at all"));
        assert!(!run.apply_line(r#"{"step":"warming-cache"}"#));
        assert!(run.apply_line(r#"{"step":"images","extra":{"nested":true}}"#));

        assert_eq!(run.stage, PublishStage::Images);
    }

    #[test]
    fn test_consume_stops_at_terminal_record() {
        let mut run = PublishRun::new();
        run.consume(vec![
            r#"{"step":"images","total":2}"#,
            r#"{"step":"done","url":"https://pages.test/fr"}"#,
            r#"{"step":"error"}"#,
        ]);

        assert_eq!(run.stage, PublishStage::Done);
    }

    #[test]
    fn test_consume_without_terminal_record_fails() {
        let mut run = PublishRun::new();
        run.consume(vec![r#"{"step":"deploy"}"#]);

        assert_eq!(run.stage, PublishStage::Error);
        assert_eq!(run.error_message.as_deref(), Some(ENDED_EARLY));
    }

    fn arb_line() -> impl Strategy<Value = String> {
        prop_oneof![
            prop::sample::select(vec![
                "starting", "images", "deploy", "upload", "done", "error", "bogus"
            ])
            .prop_map(|step| format!(r#"{{"step":"{}"}}"#, step)),
            (0u64..20).prop_map(|n| format!(r#"{{"current":{}}}"#, n)),
            Just("garbage".to_string()),
        ]
    }

    proptest! {
        #[test]
        fn prop_stage_sequence_is_monotonic(lines in prop::collection::vec(arb_line(), 0..40)) {
            let mut run = PublishRun::new();
            let mut seen = vec![run.stage];
            for line in &lines {
                run.apply_line(line);
                if *seen.last().unwrap() != run.stage {
                    seen.push(run.stage);
                }
            }

            for pair in seen.windows(2) {
                let (from, to) = (pair[0], pair[1]);
                prop_assert!(!from.is_terminal(), "{:?} was followed by {:?}", from, to);
                if to != PublishStage::Error {
                    prop_assert!(to.rank() > from.rank());
                }
            }
        }
    }

    // ==================== Consumer ====================

    fn consumer(service: &Arc<FakeService>) -> PublishConsumer {
        PublishConsumer::new(service.clone())
    }

    #[tokio::test]
    async fn test_consumer_follows_chunked_stream_to_done() {
        let service = Arc::new(FakeService::new());
        service.set_publish_chunks(vec![
            "{\"step\":\"starting\"}\n{\"step\":\"ima",
            "ges\",\"current\":1,\"total\":2}\n",
            "{\"current\":2}\n{\"step\":\"deploy\"}\n{\"step\":\"upload\"}\n",
            "{\"step\":\"done\",\"url\":\"https://pages.test/de\"}",
        ]);
        let consumer = consumer(&service);

        let result = consumer
            .start("tr-de", &CancellationToken::new())
            .await
            .expect("publish");

        let PublishStart::Finished(run) = result else {
            panic!("expected a finished run");
        };
        assert_eq!(run.stage, PublishStage::Done);
        assert_eq!(run.published_url.as_deref(), Some("https://pages.test/de"));
        assert_eq!(run.current, 2);
        assert_eq!(consumer.snapshot().stage, PublishStage::Done);
    }

    #[tokio::test]
    async fn test_consumer_reports_stream_ending_early() {
        let service = Arc::new(FakeService::new());
        service.set_publish_chunks(vec!["{\"step\":\"images\"}\n{\"step\":\"deploy\"}\n"]);

        let result = consumer(&service)
            .start("tr-de", &CancellationToken::new())
            .await
            .expect("publish");

        let PublishStart::Finished(run) = result else {
            panic!("expected a finished run");
        };
        assert_eq!(run.stage, PublishStage::Error);
        assert_eq!(run.error_message.as_deref(), Some(ENDED_EARLY));
    }

    #[tokio::test]
    async fn test_consumer_fails_on_oversized_record() {
        let service = Arc::new(FakeService::new());
        let huge = "x".repeat(MAX_RECORD_BYTES + 1);
        service.set_publish_chunks(vec!["{\"step\":\"images\"}\n", huge.as_str(), "\n"]);

        let result = consumer(&service)
            .start("tr-de", &CancellationToken::new())
            .await
            .expect("publish");

        let PublishStart::Finished(run) = result else {
            panic!("expected a finished run");
        };
        assert_eq!(run.stage, PublishStage::Error);
        assert_eq!(run.error_message.as_deref(), Some("Publish record too large"));
    }

    #[tokio::test]
    async fn test_consumer_reports_rejected_request() {
        let service = Arc::new(FakeService::new());
        service.fail_publish(api_error(409, "Domain not verified"));

        let result = consumer(&service)
            .start("tr-de", &CancellationToken::new())
            .await
            .expect("publish");

        let PublishStart::Finished(run) = result else {
            panic!("expected a finished run");
        };
        assert_eq!(run.stage, PublishStage::Error);
        assert_eq!(run.error_message.as_deref(), Some("Domain not verified"));
    }

    #[tokio::test]
    async fn test_consumer_cancel_aborts_open_stream() {
        let service = Arc::new(FakeService::new());
        service.set_publish_chunks(vec!["{\"step\":\"images\"}\n"]);
        service.hold_publish_open();
        let consumer = Arc::new(consumer(&service));
        let cancel = CancellationToken::new();

        let task = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.start("tr-de", &cancel).await })
        };

        let mut progress = consumer.subscribe();
        progress
            .wait_for(|run| run.stage == PublishStage::Images)
            .await
            .expect("progress");
        cancel.cancel();

        let result = task.await.expect("join");
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        // cancellation is not a failure
        assert_ne!(consumer.snapshot().stage, PublishStage::Error);
    }

    #[tokio::test]
    async fn test_consumer_issues_at_most_one_request() {
        let service = Arc::new(FakeService::new());
        service.hold_publish_open();
        let consumer = Arc::new(consumer(&service));
        let cancel = CancellationToken::new();

        let first = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.start("tr-de", &cancel).await })
        };
        while !consumer.has_started() {
            tokio::task::yield_now().await;
        }

        let second = consumer.start("tr-de", &cancel).await.expect("second start");
        assert_eq!(second, PublishStart::AlreadyStarted);

        cancel.cancel();
        let _ = first.await;
        let third = consumer
            .start("tr-de", &CancellationToken::new())
            .await
            .expect("third start");
        assert_eq!(third, PublishStart::AlreadyStarted);
        assert_eq!(service.count(CallKind::Publish), 1);
    }
}
