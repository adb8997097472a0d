//! ABI compatibility probe
//!
//! Confirms that an engine agrees on the config and cell layouts before any
//! real terminal is created: a 2x1 terminal is built from a config with
//! distinctive colors, put in inverse video and asked for one cell. The
//! cell must be exactly 16 bytes and carry the configured colors as
//! explicit foreground and background.

use tracing::debug;

use super::abi::{CellFlags, CellRecord, TerminalConfig, CELL_SIZE, TERMINAL_CONFIG_SIZE};
use super::engine::{with_scratch, VtEngine};
use super::{Result, VtError};
use crate::config::Color;

const PROBE_FG: u32 = 0x112233;
const PROBE_BG: u32 = 0x445566;
const PROBE_CURSOR: u32 = 0x778899;
const PROBE_SCROLLBACK: u32 = 16;
const PROBE_INPUT: &[u8] = b"\x1b[7mX";

fn probe_config() -> TerminalConfig {
    TerminalConfig {
        scrollback: PROBE_SCROLLBACK,
        foreground: Color::from_hex(PROBE_FG),
        background: Color::from_hex(PROBE_BG),
        cursor: Color::from_hex(PROBE_CURSOR),
        ansi: [Color::default(); 16],
    }
}

/// Run the probe; every engine resource it takes is released before returning
pub fn probe<E: VtEngine + ?Sized>(engine: &mut E) -> Result<()> {
    with_scratch(engine, TERMINAL_CONFIG_SIZE as u32, "probe config", |engine, config_ptr| {
        engine.write_memory(config_ptr, &probe_config().encode())?;
        let handle = engine.terminal_new(2, 1, config_ptr)?;
        if handle == 0 {
            return Err(VtError::Incompatible(
                "engine refused to create the probe terminal".to_string(),
            ));
        }
        let result = probe_terminal(engine, handle);
        let freed = engine.terminal_free(handle);
        result?;
        freed
    })
}

fn probe_terminal<E: VtEngine + ?Sized>(engine: &mut E, handle: u32) -> Result<()> {
    with_scratch(engine, PROBE_INPUT.len() as u32, "probe input", |engine, ptr| {
        engine.write_memory(ptr, PROBE_INPUT)?;
        engine.terminal_write(handle, ptr, PROBE_INPUT.len() as u32)
    })?;
    engine.render_update(handle)?;

    let mut cell = [0u8; CELL_SIZE];
    let written = with_scratch(engine, CELL_SIZE as u32, "probe viewport", |engine, ptr| {
        let written = engine.render_viewport(handle, ptr, CELL_SIZE as u32)?;
        engine.read_memory(ptr, &mut cell)?;
        Ok(written)
    })?;

    if written as usize != CELL_SIZE {
        return Err(VtError::Incompatible(format!(
            "expected cell size {}, got {}",
            CELL_SIZE, written
        )));
    }

    let record = CellRecord::decode(&cell);
    debug!("Probe cell: {:?}", record);
    let explicit = record
        .flags
        .contains(CellFlags::FG_EXPLICIT | CellFlags::BG_EXPLICIT);
    if !explicit || record.fg.to_hex() != PROBE_FG || record.bg.to_hex() != PROBE_BG {
        return Err(VtError::Incompatible(
            "terminal config layout mismatch".to_string(),
        ));
    }
    Ok(())
}
