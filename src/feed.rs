//! Drives decoded input into a dispatcher.

use std::io::BufRead;

use tracing::{error, info};

use crate::decode::Decoder;
use crate::dispatch::{DispatchError, Dispatcher};

/// Counts from one feeding pass over an input stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedReport {
    /// Documents accepted by the dispatcher.
    pub fed: u64,
    /// Input operations skipped because they failed to decode.
    pub skipped: u64,
}

/// Decode every operation from `reader` and enqueue it.
///
/// Per-operation decode failures (malformed JSON, missing or bad id) are
/// logged and skipped; the feed continues with the next operation. Only a
/// closed dispatcher aborts the pass.
pub async fn feed<R: BufRead>(
    reader: R,
    dispatcher: &Dispatcher,
) -> Result<FeedReport, DispatchError> {
    let mut report = FeedReport::default();
    let mut decoder = Decoder::new(reader);
    while let Some(next) = decoder.decode() {
        match next {
            Ok(doc) => {
                dispatcher.enqueue(doc).await?;
                report.fed += 1;
            }
            Err(error) => {
                report.skipped += 1;
                error!(%error, "skipping operation that failed to decode");
            }
        }
    }
    info!(fed = report.fed, skipped = report.skipped, "feed input exhausted");
    Ok(report)
}
