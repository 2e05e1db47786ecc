mod args;

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use args::Args;
use chrono::Utc;
use clap::Parser as _;
use sensor_datalogger::{
    humidity::absolute_humidity,
    sensor::{DeviceNames, Reading},
    udp::{self, HELLO_REQUEST, PING_TIMEOUT},
};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::from(0)
}

async fn run() -> Result<()> {
    let args = Args::parse();

    if args.hello {
        let payload = udp::query(&args.address, HELLO_REQUEST, PING_TIMEOUT)
            .await
            .context("failed to query device")?;
        let reading = Reading::parse(&payload, &DeviceNames::default(), Utc::now())
            .context("failed to parse reading")?;
        println!("{reading}");
        return Ok(());
    }

    let reply = udp::ping(&args.address)
        .await
        .context("failed to ping device")?;
    let computed = absolute_humidity(reply.relative_humidity_pct, reply.temperature_celsius);

    println!("temperature:       {:.1} °C", reply.temperature_celsius);
    println!("relative humidity: {:.1} %", reply.relative_humidity_pct);
    println!(
        "absolute humidity: {:.2} g/m³ (device), {:.2} g/m³ (computed)",
        reply.absolute_humidity, computed
    );
    println!("pressure:          {:.1} hPa", reply.pressure_hpa);

    Ok(())
}
