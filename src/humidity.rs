const H2O_MOLAR_MASS_G_PER_MOL: f64 = 18.01528;

const IDEAL_GAS_CONSTANT: f64 = 8.31446261815324;

const CELSIUS_ZERO_KELVIN: f64 = 273.15;

/// Absolute humidity in g/m³ from relative humidity (%) and temperature (°C).
///
/// Saturation vapour pressure follows Huang (2018), with separate fits over
/// liquid water (T >= 0 °C) and over ice (T < 0 °C). The partial pressure is
/// turned into mol/m³ with the ideal gas law and then into grams.
///
/// Nonsensical inputs (e.g. T <= -273.15) are not guarded and yield NaN or
/// infinite values.
pub fn absolute_humidity(relative_humidity_pct: f64, temperature_celsius: f64) -> f64 {
    let t = temperature_celsius;

    // Pa
    let vapour_pressure = if t >= 0.0 {
        (34.494 - 4924.99 / (t + 237.1)).exp() / (t + 105.0).powf(1.57)
    } else {
        (43.494 - 6545.8 / (t + 278.0)).exp() / (t + 868.0).powi(2)
    } * (relative_humidity_pct / 100.0);

    let moles_per_cubic_meter = vapour_pressure / (IDEAL_GAS_CONSTANT * (CELSIUS_ZERO_KELVIN + t));

    moles_per_cubic_meter * H2O_MOLAR_MASS_G_PER_MOL
}
