use std::path::Path;

use crate::agent::AgentMode;

/// Render the protocol options string handed to the agent through the
/// `DISPLAY` environment variable: transport/cache tuning, the control
/// port, the state-file path, and for shadows the target display and
/// writability. The trailing `:<display>` names the agent's own display.
pub(crate) fn display_options(
    mode: &AgentMode,
    port: u16,
    statefile: &Path,
    display: u32,
) -> String {
    let mut opts = vec![
        "nx/nx".to_string(),
        "link=adsl".to_string(),
        "pack=2m-png".to_string(),
        "cache=128M".to_string(),
        "images=128M".to_string(),
        "accept=localhost".to_string(),
        format!("listen={port}"),
        format!("state={}", statefile.display()),
        "client=linux".to_string(),
    ];

    if let AgentMode::Shadow {
        target_display,
        read_only,
    } = mode
    {
        opts.push(format!("shadow=:{target_display}"));
        opts.push(format!("shadowmode={}", if *read_only { "0" } else { "1" }));
    }

    format!("{}:{display}", opts.join(","))
}
