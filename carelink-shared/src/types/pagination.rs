use serde::Deserialize;

/// `?page=&per_page=` query parameters for list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

/// Pages past this are clamped; deeper history is not browsable page by page.
pub const MAX_PAGE: u64 = 10_000;

fn default_page() -> u64 { 1 }
fn default_per_page() -> u64 { 20 }

impl PaginationParams {
    pub fn offset(&self) -> u64 {
        self.page.clamp(1, MAX_PAGE).saturating_sub(1).saturating_mul(self.limit())
    }

    /// Page size, capped at 100.
    pub fn limit(&self) -> u64 {
        self.per_page.clamp(1, 100)
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: default_page(), per_page: default_per_page() }
    }
}
