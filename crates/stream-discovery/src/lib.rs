pub mod builder;
pub mod onvif;
pub mod probe;
pub mod scanner;
pub mod sink;

pub use builder::{BuildContext, UrlBuilder};
pub use onvif::{DeviceDiscovery, OnvifProber};
pub use probe::{StreamProbe, StreamTester, TestResult};
pub use scanner::{ScanResult, Scanner, ScannerConfig};
pub use sink::EventSink;
