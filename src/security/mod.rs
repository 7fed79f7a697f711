mod ip_filter;

pub use ip_filter::IpFilterLayer;
