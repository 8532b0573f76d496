use std::net::Ipv4Addr;

/// Commands crossing from the controller to the bridge layer. Each maps
/// to an action the hardware-facing side must perform; the channel gives
/// the bridge back-pressure over the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCmd {
    Stop,
    Pause,
    Unpause,
    /// Player power/output enable toggled by the server.
    OnOff(bool),
    /// Gain in 0.0..=1.0.
    Volume(f64),
    SetName(String),
    SetServer(Ipv4Addr),
    Play,
    /// A new track is ready to be pulled from the bridge URL.
    SetTrack {
        index: u32,
        url: String,
        mimetype: String,
    },
}
