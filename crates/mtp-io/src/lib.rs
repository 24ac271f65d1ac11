pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod modbus;
pub mod proxy;
pub mod service_manager;
pub mod sim;
pub mod tag_manager;

pub use config::{CommLossAction, ConfigError, GatewayConfig, ProxyMode, ServiceConfig};
pub use connector::{ConnectionState, ConnectorHealth, ConnectorPort};
pub use error::{ConnectorError, GatewayError};
pub use metrics::{init_metrics, serve_metrics};
pub use modbus::ModbusTcpConnector;
pub use proxy::{ProxyError, ProxyResult, ServiceProxy};
pub use service_manager::{EmergencyStopReport, ServiceEvent, ServiceListener, ServiceManager};
pub use sim::SimulatedConnector;
pub use tag_manager::{ConnectorBinding, Subscription, TagManager, TagSnapshot, TagStatistics};
