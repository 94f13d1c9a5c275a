pub mod aggregator;
pub mod exchange;
pub mod limiter;
pub mod synthetic;
pub mod util;
pub mod vendor;

use std::sync::Arc;

use crate::core::config::DataServiceConfig;
use crate::core::source::{SeriesSource, SourceId};

pub use aggregator::AggregatorSource;
pub use exchange::ExchangeSource;
pub use limiter::{BackoffPolicy, RateLimiter};
pub use synthetic::SyntheticGenerator;
pub use vendor::VendorSource;

/// Builds the adapter configured for `id`. `Synthetic` has no adapter.
///
/// Adapters that make several calls per fetch pace the extra ones on `limiter`.
pub fn source_for(
    id: SourceId,
    config: &DataServiceConfig,
    limiter: &Arc<RateLimiter>,
) -> Option<Arc<dyn SeriesSource>> {
    let settings = config.sources.get(id)?;
    let source: Arc<dyn SeriesSource> = match id {
        SourceId::Primary => Arc::new(ExchangeSource::new(
            &settings.base_url,
            Arc::clone(limiter),
        )),
        SourceId::Secondary => Arc::new(AggregatorSource::new(&settings.base_url)),
        SourceId::Tertiary => Arc::new(VendorSource::new(
            &settings.base_url,
            settings.api_key.as_deref(),
        )),
        SourceId::Synthetic => return None,
    };
    Some(source)
}
