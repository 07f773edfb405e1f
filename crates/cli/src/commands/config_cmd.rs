//! `tmi config` — configuration management.

use anyhow::Context;

use tmi_config::AppConfig;

pub async fn validate() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    config.validate().context("validating configuration")?;
    println!("Configuration is valid.");
    Ok(())
}

pub async fn show() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    // Debug impl redacts secret material
    println!("{config:#?}");
    Ok(())
}

pub async fn init() -> anyhow::Result<()> {
    let path = std::path::Path::new("tmi.toml");
    if path.exists() {
        println!("tmi.toml already exists; not overwriting.");
        return Ok(());
    }
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config).context("rendering default configuration")?;
    std::fs::write(path, rendered).context("writing tmi.toml")?;
    println!("Wrote default configuration to tmi.toml");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tmi_config::AppConfig;

    #[test]
    fn default_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
