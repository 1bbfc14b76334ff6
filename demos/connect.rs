//! Example: Connect to an Arrowhead panel, detect its layout and print status.

use arrowhead_lan_bridge::{ArrowheadPanel, LayoutOverrides, PanelConfig, PanelType};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = PanelConfig::builder()
        .panel_type(PanelType::Eci)
        .host("192.168.0.100")
        .port(9000)
        .user_pin("1 123")
        .build();

    println!("Connecting to panel...");
    let panel = ArrowheadPanel::new(config);
    panel.connect().await?;

    let layout = panel.detect_layout(&LayoutOverrides::default()).await;
    println!(
        "\nLayout ({}): {} zones, areas {:?}",
        layout.method.as_str(),
        layout.total_zones(),
        layout.active_areas
    );
    for expander in &layout.expanders {
        println!("  Expander {:2}: zones {:?}", expander.index, expander.range);
    }

    let state = panel.refresh().await?;
    if let Some(version) = &state.version_string {
        println!("\nFirmware: {version} (enhanced mode: {})", state.enhanced_mode_active);
    }

    for &area in &layout.active_areas {
        let status = panel.area_status(area).await?;
        println!(
            "\n--- Area {:2} ---\n  armed={} stay={} alarm={} open={:?} bypassed={:?}",
            status.area, status.armed, status.stay, status.alarm_active, status.open_zones, status.bypassed_zones,
        );
    }

    println!("\n--- Outputs ---");
    for output in state.outputs.values() {
        println!("  Output {:2}: active={}", output.id, output.active);
    }

    println!("\n--- System ---");
    println!("  Ready to arm: {}", state.ready_to_arm);
    println!("  Mains OK: {}", state.system.mains_ok());
    println!("  Battery OK: {}", state.system.battery_ok());

    println!("\nPress Ctrl+C to disconnect...");
    tokio::signal::ctrl_c().await?;
    panel.disconnect().await?;
    println!("Disconnected.");

    Ok(())
}
