use std::sync::Arc;

use async_stream::stream;
use common::{
    error::AppError,
    types::ChatFragment,
    utils::{content_filter::ContentFilter, generation::FragmentStream},
};
use futures::StreamExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Filters each upstream fragment independently and relays it in arrival order.
///
/// Fragments that filter down to nothing are dropped. The first upstream error, or
/// the deadline passing, is yielded once and ends the stream. Dropping the returned
/// stream drops `upstream` with it.
pub fn relay_fragments(
    mut upstream: FragmentStream,
    filter: Arc<ContentFilter>,
    deadline: Instant,
    request_id: String,
) -> FragmentStream {
    Box::pin(stream! {
        let mut relayed: usize = 0;
        loop {
            match timeout_at(deadline, upstream.next()).await {
                Err(_) => {
                    warn!(%request_id, relayed, "generation deadline passed mid-stream");
                    yield Err(AppError::ProviderUnavailable(
                        "generation provider timed out".into(),
                    ));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(fragment))) => {
                    let content = filter.filter(&fragment.content);
                    if content.is_empty() {
                        continue;
                    }
                    relayed = relayed.saturating_add(1);
                    yield Ok(ChatFragment::new(content));
                }
                Ok(Some(Err(err))) => {
                    warn!(%request_id, relayed, kind = err.kind(), error = %err, "generation failed mid-stream");
                    yield Err(err);
                    break;
                }
            }
        }
        debug!(%request_id, relayed, "chat stream finished");
    })
}
