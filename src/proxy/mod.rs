pub mod pool;
pub mod transport;

pub use pool::{fetch_via_proxy_pool, parse_pool, HeaderVariant, PoolFetchOutcome, DEFAULT_VARIANTS};
pub use transport::{fetch_via_proxy, ProxyConfig, ProxyError, ProxyResponse};
