pub mod config;
pub mod humidity;
pub mod influx;
pub mod logging;
pub mod pipeline;
pub mod sensor;
pub mod udp;
