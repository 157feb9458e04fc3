use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::models::{host_of, CollectedArticle};

/// Floor returned by `wait_time` when nothing can be dispatched for a
/// reason other than the inter-request delay (e.g. every host is at its
/// concurrency cap).
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Per-host dispatch scheduler for the crawl phase. Enforces three limits
/// at once: per-host concurrency, global concurrency, and a minimum gap
/// between dispatches to the same host. Hosts are scanned in insertion
/// order so a long skewed feed cannot starve the others.
pub struct DomainQueue {
    host_order: Vec<String>,
    queues: HashMap<String, VecDeque<CollectedArticle>>,
    active: HashMap<String, usize>,
    last_dispatch: HashMap<String, Instant>,
    total_active: usize,
    max_per_domain: usize,
    max_total: usize,
    delay: Duration,
}

impl DomainQueue {
    pub fn new(max_per_domain: usize, max_total: usize, delay_ms: u64) -> Self {
        Self {
            host_order: Vec::new(),
            queues: HashMap::new(),
            active: HashMap::new(),
            last_dispatch: HashMap::new(),
            total_active: 0,
            max_per_domain: max_per_domain.max(1),
            max_total: max_total.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Host key for throttling: the resolved target's host when known.
    pub fn host_key(article: &CollectedArticle) -> String {
        host_of(article.effective_url()).unwrap_or_else(|| article.url.clone())
    }

    pub fn push(&mut self, article: CollectedArticle) {
        let host = Self::host_key(&article);
        if !self.queues.contains_key(&host) {
            self.host_order.push(host.clone());
        }
        self.queues.entry(host).or_default().push_back(article);
    }

    pub fn queued(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn active_total(&self) -> usize {
        self.total_active
    }

    pub fn is_drained(&self) -> bool {
        self.queued() == 0 && self.total_active == 0
    }

    /// Pop the next dispatchable article, charging its host's counters
    /// and stamping its dispatch time.
    pub fn next_available(&mut self) -> Option<CollectedArticle> {
        if self.total_active >= self.max_total {
            return None;
        }
        let now = Instant::now();
        for host in &self.host_order {
            let queue_empty = self.queues.get(host).map(|q| q.is_empty()).unwrap_or(true);
            if queue_empty {
                continue;
            }
            if self.active.get(host).copied().unwrap_or(0) >= self.max_per_domain {
                continue;
            }
            if let Some(last) = self.last_dispatch.get(host) {
                if now.duration_since(*last) < self.delay {
                    continue;
                }
            }

            let article = self
                .queues
                .get_mut(host)
                .and_then(|q| q.pop_front())
                .expect("queue checked non-empty");
            *self.active.entry(host.clone()).or_insert(0) += 1;
            self.total_active += 1;
            self.last_dispatch.insert(host.clone(), now);
            return Some(article);
        }
        None
    }

    /// Time until any host could become dispatchable: zero when one
    /// already is, the smallest remaining inter-request gap otherwise,
    /// or a short idle wait when only completions can unblock us.
    pub fn wait_time(&self) -> Duration {
        if self.total_active >= self.max_total {
            return IDLE_WAIT;
        }
        let now = Instant::now();
        let mut min_wait: Option<Duration> = None;
        for host in &self.host_order {
            let queue_empty = self.queues.get(host).map(|q| q.is_empty()).unwrap_or(true);
            if queue_empty {
                continue;
            }
            if self.active.get(host).copied().unwrap_or(0) >= self.max_per_domain {
                continue;
            }
            let wait = match self.last_dispatch.get(host) {
                Some(last) => {
                    let elapsed = now.duration_since(*last);
                    if elapsed >= self.delay {
                        Duration::ZERO
                    } else {
                        self.delay - elapsed
                    }
                }
                None => Duration::ZERO,
            };
            if wait.is_zero() {
                return Duration::ZERO;
            }
            min_wait = Some(match min_wait {
                Some(current) => current.min(wait),
                None => wait,
            });
        }
        min_wait.unwrap_or(IDLE_WAIT)
    }

    /// Release the counters charged at dispatch. Must not underflow even
    /// if called for an article that was never dispatched.
    pub fn mark_complete(&mut self, article: &CollectedArticle) {
        let host = Self::host_key(article);
        if let Some(active) = self.active.get_mut(&host) {
            *active = active.saturating_sub(1);
        }
        self.total_active = self.total_active.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn article(url: &str) -> CollectedArticle {
        CollectedArticle {
            url: url.to_string(),
            resolved_url: None,
            title: None,
            published_at: None,
            feed_source: "test".to_string(),
        }
    }

    #[test]
    fn host_key_prefers_resolved_url() {
        let mut item = article("https://news.google.com/rss/articles/abc");
        item.resolved_url = Some("https://site.example/a".to_string());
        assert_eq!(DomainQueue::host_key(&item), "site.example");
    }

    #[tokio::test]
    async fn per_host_dispatches_respect_the_delay() {
        let mut queue = DomainQueue::new(2, 10, 50);
        for i in 0..6 {
            queue.push(article(&format!("https://h.example/{}", i)));
        }

        let mut dispatch_times: Vec<Instant> = Vec::new();
        while !queue.is_drained() {
            match queue.next_available() {
                Some(item) => {
                    dispatch_times.push(Instant::now());
                    // Completing immediately keeps the concurrency cap
                    // out of play; only the delay gates dispatches.
                    queue.mark_complete(&item);
                }
                None => tokio::time::sleep(queue.wait_time()).await,
            }
        }

        assert_eq!(dispatch_times.len(), 6);
        for pair in dispatch_times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap >= Duration::from_millis(50),
                "dispatch gap {:?} below the per-host delay",
                gap
            );
        }
    }

    #[test]
    fn zero_delay_still_enforces_per_host_cap() {
        let mut queue = DomainQueue::new(2, 10, 0);
        for i in 0..6 {
            queue.push(article(&format!("https://h.example/{}", i)));
        }

        let first = queue.next_available().unwrap();
        let second = queue.next_available().unwrap();
        assert!(queue.next_available().is_none());
        assert_eq!(queue.active_total(), 2);
        assert_eq!(queue.wait_time(), Duration::from_millis(100));

        queue.mark_complete(&first);
        assert!(queue.next_available().is_some());
        queue.mark_complete(&second);
    }

    #[test]
    fn global_cap_binds_across_hosts() {
        let mut queue = DomainQueue::new(2, 2, 0);
        queue.push(article("https://a.example/1"));
        queue.push(article("https://b.example/1"));
        queue.push(article("https://c.example/1"));

        assert!(queue.next_available().is_some());
        assert!(queue.next_available().is_some());
        assert!(queue.next_available().is_none());
        assert_eq!(queue.active_total(), 2);
    }

    #[test]
    fn hosts_are_scanned_in_insertion_order() {
        let mut queue = DomainQueue::new(1, 10, 0);
        queue.push(article("https://first.example/1"));
        queue.push(article("https://second.example/1"));

        let item = queue.next_available().unwrap();
        assert_eq!(item.url, "https://first.example/1");
    }

    #[test]
    fn mark_complete_does_not_underflow() {
        let mut queue = DomainQueue::new(2, 10, 0);
        let item = article("https://h.example/1");
        queue.mark_complete(&item);
        assert_eq!(queue.active_total(), 0);

        queue.push(article("https://h.example/2"));
        assert!(queue.next_available().is_some());
        assert_eq!(queue.active_total(), 1);
    }

    #[test]
    fn wait_time_is_zero_when_dispatchable() {
        let mut queue = DomainQueue::new(2, 10, 1000);
        queue.push(article("https://h.example/1"));
        assert_eq!(queue.wait_time(), Duration::ZERO);
        let _ = queue.next_available().unwrap();

        // Second item for the same host now waits out the delay.
        queue.push(article("https://h.example/2"));
        let wait = queue.wait_time();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(1000));
    }
}
