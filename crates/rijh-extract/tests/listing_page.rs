//! End-to-end extraction over inline page fixtures with a scripted fetcher.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rijh_core::{ExperienceLevel, WorkType};
use rijh_extract::{extract_page, harvest_term, search_page_url, SearchConfig};
use rijh_fetch::{FetchError, PageFetcher};

const RESULTS_PAGE: &str = r#"<html><body>
  <div class="base-card">
    <time class="job-search-card__listdate">2 days ago</time>
    <h3 class="base-search-card__title">Senior Backend Developer</h3>
    <h4 class="base-search-card__subtitle">Acme Ltd</h4>
    <span class="job-search-card__location">London, England, United Kingdom</span>
    <a class="base-card__full-link" href="https://jobs.test/view/1"></a>
  </div>
  <div class="base-card">
    <time class="job-search-card__listdate">2 weeks ago</time>
    <h3 class="base-search-card__title">Archived Role</h3>
    <h4 class="base-search-card__subtitle">Old Corp</h4>
    <span class="job-search-card__location">Bristol, UK</span>
    <a class="base-card__full-link" href="https://jobs.test/view/2"></a>
  </div>
  <div class="base-card">
    <h3 class="base-search-card__title">Graduate Engineer</h3>
    <h4 class="base-search-card__subtitle">Campus Hire Co</h4>
    <span class="job-search-card__location">Greater Manchester Area</span>
    <a class="base-card__full-link" href="https://jobs.test/view/3"></a>
  </div>
</body></html>"#;

const DETAIL_SENIOR: &str = r#"<html><body>
  <div class="show-more-less-html__markup">
    Senior engineer owning the payments platform. Hybrid working, remote days available.
  </div>
</body></html>"#;

const DETAIL_GRADUATE: &str = r#"<html><body>
  <div class="show-more-less-html__markup">
    Graduate scheme; office based in Manchester.
  </div>
</body></html>"#;

const STALE_PAGE: &str = r#"<html><body>
  <div class="base-card">
    <time class="job-search-card__listdate">6 days ago</time>
    <h3 class="base-search-card__title">Stale Role</h3>
    <h4 class="base-search-card__subtitle">Late Corp</h4>
    <span class="job-search-card__location">Leeds</span>
    <a class="base-card__full-link" href="https://jobs.test/view/stale"></a>
  </div>
</body></html>"#;

const EMPTY_PAGE: &str = "<html><body><p>No results.</p></body></html>";

#[derive(Default)]
struct ScriptedFetcher {
    routes: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn route(mut self, url: &str, body: &str) -> Self {
        self.routes.insert(url.to_string(), body.to_string());
        self
    }

    fn fetched_urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.routes
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

fn test_config(max_pages: usize) -> SearchConfig {
    SearchConfig {
        base_url: "https://jobs.test/search".to_string(),
        max_pages_per_term: max_pages,
        page_delay: Duration::ZERO,
        ..SearchConfig::default()
    }
}

#[tokio::test]
async fn results_page_yields_normalized_recent_records() {
    let fetcher = ScriptedFetcher::default()
        .route("https://jobs.test/view/1", DETAIL_SENIOR)
        .route("https://jobs.test/view/3", DETAIL_GRADUATE);

    let extraction = extract_page(RESULTS_PAGE, "Backend Developer", &fetcher).await;

    assert_eq!(extraction.cards_seen, 3);
    assert!(extraction.recent_found);
    assert_eq!(extraction.records.len(), 2);

    let senior = &extraction.records[0];
    assert_eq!(senior.title, "Senior Backend Developer");
    assert_eq!(senior.company, "Acme Ltd");
    assert_eq!(senior.raw_location, "London, England, United Kingdom");
    assert_eq!(senior.location, "London");
    assert_eq!(senior.experience_level, ExperienceLevel::Senior);
    assert_eq!(senior.work_type, WorkType::Hybrid);
    assert_eq!(senior.category, "Backend Developer");
    assert_eq!(senior.posted_date_text, "2 days ago");
    assert_eq!(senior.url, "https://jobs.test/view/1");

    // Undated card: kept, with the sentinel posted-date text.
    let graduate = &extraction.records[1];
    assert_eq!(graduate.location, "Manchester");
    assert_eq!(graduate.experience_level, ExperienceLevel::Entry);
    assert_eq!(graduate.work_type, WorkType::OnSite);
    assert_eq!(graduate.posted_date_text, "Recently");

    // The stale card's detail page is never requested.
    assert!(!fetcher
        .fetched_urls()
        .contains(&"https://jobs.test/view/2".to_string()));
}

#[tokio::test]
async fn failed_detail_fetch_skips_only_that_card() {
    // No route for view/3: its detail fetch 404s and the card is dropped.
    let fetcher = ScriptedFetcher::default().route("https://jobs.test/view/1", DETAIL_SENIOR);

    let extraction = extract_page(RESULTS_PAGE, "Backend Developer", &fetcher).await;
    assert_eq!(extraction.records.len(), 1);
    assert_eq!(extraction.records[0].url, "https://jobs.test/view/1");
    assert!(extraction.recent_found);
}

#[tokio::test]
async fn missing_description_block_defaults_to_mid_level_on_site() {
    let fetcher = ScriptedFetcher::default()
        .route("https://jobs.test/view/1", "<html><body></body></html>")
        .route("https://jobs.test/view/3", "<html><body></body></html>");

    let extraction = extract_page(RESULTS_PAGE, "Backend Developer", &fetcher).await;
    // "Senior" appears only in the description, which is empty here, so the
    // first record falls back to the defaults.
    assert_eq!(
        extraction.records[0].experience_level,
        ExperienceLevel::Mid
    );
    assert_eq!(extraction.records[0].work_type, WorkType::OnSite);
}

#[tokio::test]
async fn two_consecutive_stale_pages_stop_the_term() {
    let config = test_config(5);
    let mut fetcher = ScriptedFetcher::default();
    for page in 0..5 {
        fetcher = fetcher.route(&search_page_url(&config, "Backend Developer", page), STALE_PAGE);
    }

    let records = harvest_term(&config, &fetcher, "Backend Developer").await;

    assert!(records.is_empty());
    let search_fetches = fetcher
        .fetched_urls()
        .iter()
        .filter(|u| u.contains("/search"))
        .count();
    assert_eq!(search_fetches, 2);
}

#[tokio::test]
async fn page_without_cards_is_terminal() {
    let config = test_config(5);
    let fetcher = ScriptedFetcher::default()
        .route(&search_page_url(&config, "Backend Developer", 0), EMPTY_PAGE);

    let records = harvest_term(&config, &fetcher, "Backend Developer").await;
    assert!(records.is_empty());
    assert_eq!(fetcher.fetched_urls().len(), 1);
}

#[tokio::test]
async fn failed_page_fetch_stops_the_term_without_error() {
    let config = test_config(3);
    let fetcher = ScriptedFetcher::default(); // every fetch 404s

    let records = harvest_term(&config, &fetcher, "Backend Developer").await;
    assert!(records.is_empty());
    assert_eq!(fetcher.fetched_urls().len(), 1);
}

#[tokio::test]
async fn recent_page_resets_the_stale_streak() {
    let config = test_config(4);
    let fetcher = ScriptedFetcher::default()
        .route(&search_page_url(&config, "Backend Developer", 0), STALE_PAGE)
        .route(&search_page_url(&config, "Backend Developer", 1), RESULTS_PAGE)
        .route(&search_page_url(&config, "Backend Developer", 2), STALE_PAGE)
        .route(&search_page_url(&config, "Backend Developer", 3), STALE_PAGE)
        .route("https://jobs.test/view/1", DETAIL_SENIOR)
        .route("https://jobs.test/view/3", DETAIL_GRADUATE);

    let records = harvest_term(&config, &fetcher, "Backend Developer").await;

    assert_eq!(records.len(), 2);
    let search_fetches = fetcher
        .fetched_urls()
        .iter()
        .filter(|u| u.contains("/search"))
        .count();
    assert_eq!(search_fetches, 4);
}
