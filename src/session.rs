use crate::coordinator::CoordinatorHandle;
use crate::error::ConnectionError;
use crate::protocol;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info};

/// Longest request frame accepted, newline included
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Serve build requests on one connection until the peer closes it or the
/// server shuts down. The stream is dropped, and so closed, on every return.
pub async fn handle_connection(
    stream: TcpStream,
    coordinator: CoordinatorHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let got_frame = tokio::select! {
            read = read_frame(&mut reader) => read?,
            _ = shutdown.changed() => {
                debug!("server stopping; closing connection");
                return Ok(());
            }
        };
        if !got_frame {
            debug!("peer closed connection");
            return Ok(());
        }

        let job = coordinator.request_build().await?;
        let job_id = job.id();
        debug!(job = %job_id, "waiting for build");
        let result = job.wait().await?;

        let mut payload = protocol::encode_or_empty(&result);
        payload.push(b'\n');
        writer.write_all(&payload).await?;
        writer.flush().await?;
        info!(
            job = %job_id,
            errors = result.error_count(),
            warnings = result.warning_count(),
            "sent build report"
        );
    }
}

/// Skip past one newline-delimited frame without keeping its bytes.
///
/// Returns `false` at end of stream with nothing read. A trailing frame
/// without a newline still counts.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<bool, ConnectionError> {
    let mut len = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(len > 0);
        }
        let (used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(newline) => (newline + 1, true),
            None => (available.len(), false),
        };
        reader.consume(used);
        len += used;

        if len > MAX_FRAME_LEN {
            return Err(ConnectionError::FrameTooLong {
                limit: MAX_FRAME_LEN,
            });
        }
        if complete {
            return Ok(true);
        }
    }
}
