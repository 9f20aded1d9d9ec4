use std::collections::VecDeque;
use std::future::Future;

use anyhow::Result;
use futures::stream::{self, Stream, TryStreamExt};

struct PagerState<F, T> {
    fetch: F,
    per_page: u32,
    next_page: Option<u32>,
    buffered: VecDeque<T>,
}

/// Turns a page-addressed listing into a lazy stream of items.
///
/// Pages are numbered from 1 and fetched only when the consumer pulls past
/// the end of the previous one. A page shorter than `per_page` is the last.
/// Dropping the stream early means no further page is requested.
pub fn paginate<T, F, Fut>(per_page: u32, fetch: F) -> impl Stream<Item = Result<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let state = PagerState {
        fetch,
        per_page: per_page.max(1),
        next_page: Some(1),
        buffered: VecDeque::new(),
    };

    stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.buffered.pop_front() {
                return Ok::<_, anyhow::Error>(Some((item, state)));
            }
            let Some(page) = state.next_page else {
                return Ok(None);
            };
            let items = (state.fetch)(page).await?;
            state.next_page = if items.len() < state.per_page as usize {
                None
            } else {
                Some(page + 1)
            };
            state.buffered.extend(items);
        }
    })
}

/// Drains every page of a listing.
pub async fn collect_all<T, F, Fut>(per_page: u32, fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    paginate(per_page, fetch).try_collect().await
}
