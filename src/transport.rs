//! JSON-lines tool transport.
//!
//! Each input line is one tool call, e.g.
//! `{"tool":"start_collection","arguments":{"identifier":"json_udp"}}`, and
//! produces exactly one response line. Blank lines are ignored.

use std::io;

use flowwatch_core::ToolSurface;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Answer requests from `reader` on `writer` until end of input.
///
/// Returns the number of requests served.
pub async fn serve<R, W>(tools: &ToolSurface, reader: R, mut writer: W) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut served = 0;

    while let Some(line) = lines.next_line().await? {
        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let response = tools.invoke_json(request).await;
        let mut encoded = serde_json::to_vec(&response).map_err(io::Error::other)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        served += 1;
    }

    debug!(served, "tool transport reached end of input");
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use flowwatch_core::{CapabilityRegistry, LatencyMonitor, LoaderCatalog, ToolResponse};

    fn tools() -> ToolSurface {
        let mut catalog = LoaderCatalog::new();
        flowwatch_capabilities::register_all(&mut catalog);
        let monitor = Arc::new(LatencyMonitor::default());
        let registry = Arc::new(CapabilityRegistry::new(
            catalog,
            monitor.clone(),
            Duration::from_secs(1),
        ));
        ToolSurface::new(registry, monitor)
    }

    fn responses(output: &[u8]) -> Vec<ToolResponse> {
        std::str::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn one_response_per_request() {
        let input = concat!(
            r#"{"tool":"list_capabilities"}"#,
            "\n\n",
            r#"{"tool":"load_capability","arguments":{"identifier":"json_udp"}}"#,
            "\n",
            r#"{"tool":"analyze_latency","arguments":{}}"#,
            "\n",
        );
        let mut output = Vec::new();

        let served = serve(&tools(), input.as_bytes(), &mut output).await.unwrap();
        assert_eq!(served, 3);

        let responses = responses(&output);
        assert_eq!(responses.len(), 3);
        assert!(responses[0].is_ok());
        assert!(responses[1].is_ok());
        assert!(matches!(responses[2], ToolResponse::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn garbage_gets_an_error_line() {
        let mut output = Vec::new();
        serve(&tools(), &b"not json\n"[..], &mut output).await.unwrap();

        let responses = responses(&output);
        assert_eq!(
            responses[0].error_kind(),
            Some(flowwatch_core::ErrorKind::InvalidRequest)
        );
    }
}
