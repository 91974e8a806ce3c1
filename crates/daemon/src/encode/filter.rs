//! drawtext filter graph for the text overlays
//!
//! Sources are always emitted in the same order: static text, frequency,
//! dynamic text. Channel-backed sources use `reload=1` so the encoder picks up
//! new values without a restart.

use crate::config::OverlayConfig;
use crate::overlay::ChannelPaths;
use std::path::Path;

/// Escape text for a drawtext option value inside a filter graph
///
/// Two levels apply: the option parser (`\`, `'`, `:`) and the graph parser
/// (`\`, `'`, `,`, `;`, `[`, `]`).
pub fn escape_drawtext(text: &str) -> String {
    let mut option_level = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '\'' | ':') {
            option_level.push('\\');
        }
        option_level.push(c);
    }

    let mut graph_level = String::with_capacity(option_level.len());
    for c in option_level.chars() {
        if matches!(c, '\\' | '\'' | ',' | ';' | '[' | ']') {
            graph_level.push('\\');
        }
        graph_level.push(c);
    }
    graph_level
}

fn style(cfg: &OverlayConfig) -> String {
    format!(
        "fontfile={}:fontsize={}:fontcolor=white:box=1:boxcolor=black@0.5:boxborderw=6",
        escape_drawtext(&cfg.font_file),
        cfg.font_size
    )
}

fn static_text(cfg: &OverlayConfig) -> String {
    format!(
        "drawtext={}:expansion=none:text={}:x=10:y=10",
        style(cfg),
        escape_drawtext(&cfg.text)
    )
}

fn reloading_text(cfg: &OverlayConfig, file: &Path, position: &str) -> String {
    format!(
        "drawtext={}:expansion=none:textfile={}:reload=1:{}",
        style(cfg),
        escape_drawtext(&file.to_string_lossy()),
        position
    )
}

/// Individual drawtext filters for the enabled sources, in display order
pub fn overlay_filters(cfg: &OverlayConfig, paths: &ChannelPaths) -> Vec<String> {
    let mut filters = Vec::new();
    if cfg.static_enabled {
        filters.push(static_text(cfg));
    }
    if cfg.show_frequency {
        filters.push(reloading_text(cfg, &paths.frequency, "x=10:y=h-th-10"));
    }
    if cfg.dynamic_enabled {
        filters.push(reloading_text(cfg, &paths.dynamic, "x=w-tw-10:y=10"));
    }
    filters
}

/// Comma-joined graph, or `None` when no overlay is enabled
pub fn build_filter_graph(cfg: &OverlayConfig, paths: &ChannelPaths) -> Option<String> {
    let filters = overlay_filters(cfg, paths);
    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}
