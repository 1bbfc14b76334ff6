//! Example: Subscribe to zone messages and print changes.

use arrowhead_lan_bridge::{
    ArrowheadPanel, ConnectionState, PanelConfig, PanelEvent, PanelMessage, PanelType, ZoneStatusFlags,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = PanelConfig::builder()
        .panel_type(PanelType::Esx)
        .host("192.168.0.100")
        .build();

    let panel = ArrowheadPanel::new(config);
    let mut events = panel.subscribe();
    panel.connect().await?;

    println!("Listening for zone events (Ctrl+C to stop)...\n");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(PanelEvent::Message { message: PanelMessage::Zone { flag, set, zone }, .. }) => {
                        println!("Zone {zone}: {}", ZoneStatusFlags::describe(flag, set));
                    }
                    Ok(PanelEvent::Message { message: PanelMessage::EntryDelay { zone, seconds }, .. }) => {
                        println!("Zone {zone}: entry delay {seconds}s");
                    }
                    Ok(PanelEvent::ConnectionStateChanged { new: ConnectionState::Reconnecting, .. }) => {
                        println!("Panel link lost, reconnecting...");
                    }
                    Ok(PanelEvent::ReconnectExhausted { attempts }) => {
                        println!("Gave up after {attempts} attempts");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        println!("Event channel error: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    panel.disconnect().await?;
    Ok(())
}
