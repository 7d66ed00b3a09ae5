//! Newline-delimited JSON control lines
//!
//! Stands in for the management-plane watch stream and the agents' telemetry
//! publisher when the service runs standalone:
//!
//! ```text
//! {"kind":"watch","event":{"type":"Created","cluster":{"id":"c1"}}}
//! {"kind":"publish","subject":"agent-health.status.c1","payload":{"connected":false,"timestamp":"2024-01-01T00:00:00Z"}}
//! ```

use crate::router::EventRouter;
use crate::stream::StreamBackbone;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_shared::WatchEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlLine {
    /// Lifecycle event dispatched through the router
    Watch { event: WatchEvent },

    /// Health payload published onto the ingress stream as JSON
    Publish {
        subject: String,
        payload: serde_json::Value,
    },
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> anyhow::Result<Option<ControlLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let parsed = serde_json::from_str(line).context("invalid control line")?;
    Ok(Some(parsed))
}

/// Apply one control line. Watch events are dispatched in the background.
pub async fn apply(
    line: ControlLine,
    router: &Arc<EventRouter<WatchEvent>>,
    stream: &dyn StreamBackbone,
) -> anyhow::Result<()> {
    match line {
        ControlLine::Watch { event } => {
            debug!("Dispatching {:?}", event);
            let _ = router.handle_event(event);
        }
        ControlLine::Publish { subject, payload } => {
            let data = serde_json::to_vec(&payload)?;
            let sequence = stream
                .publish(&subject, data)
                .await
                .with_context(|| format!("failed to publish on {}", subject))?;
            debug!("Published #{} on {}", sequence, subject);
        }
    }
    Ok(())
}

/// Read and apply control lines until EOF or cancellation. Bad lines are
/// logged and skipped. Returns the number of lines applied.
pub async fn run<R>(
    reader: R,
    router: Arc<EventRouter<WatchEvent>>,
    stream: Arc<dyn StreamBackbone>,
    shutdown: CancellationToken,
) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0;
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line.context("failed to read control input")? {
                Some(line) => line,
                None => break,
            },
        };
        line_no += 1;

        let parsed = match parse_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                warn!("Skipping control line {}: {:#}", line_no, e);
                continue;
            }
        };
        match apply(parsed, &router, stream.as_ref()).await {
            Ok(()) => applied += 1,
            Err(e) => warn!("Control line {} failed: {:#}", line_no, e),
        }
    }
    Ok(applied)
}
