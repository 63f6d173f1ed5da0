use crate::traits::ApprovalHandler;
use async_trait::async_trait;
use keel_policy::ConfirmationRequest;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

type Reader = Box<dyn AsyncBufRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Asks for y/n confirmation on a line-based terminal.
pub struct TerminalInterface {
    input: Mutex<Reader>,
    output: Mutex<Writer>,
}

impl TerminalInterface {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }

    pub fn with_io(
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    async fn prompt(&self, request: &ConfirmationRequest) -> io::Result<()> {
        let marker = if request.is_dangerous { "⛔" } else { "⚠️ " };
        let text = format!(
            "{} Approval required: {}\nApprove? (y/n): ",
            marker,
            request.summary()
        );
        let mut out = self.output.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.flush().await
    }

    /// Next line, trimmed. `None` on EOF.
    async fn read_answer(&self) -> io::Result<Option<String>> {
        let mut reader = self.input.lock().await;
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

impl Default for TerminalInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalHandler for TerminalInterface {
    /// EOF and terminal I/O errors count as a denial.
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        if let Err(e) = self.prompt(request).await {
            warn!(call_id = %request.call_id, error = %e, "Could not show confirmation prompt");
            return false;
        }
        match self.read_answer().await {
            Ok(Some(answer)) => answer.to_lowercase().starts_with('y'),
            Ok(None) => false,
            Err(e) => {
                warn!(call_id = %request.call_id, error = %e, "Could not read confirmation answer");
                false
            }
        }
    }
}
