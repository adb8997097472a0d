//! Minimal wasm binary assembler for tests

pub const I32: u8 = 0x7f;

pub mod op {
    pub const BLOCK_VOID: u8 = 0x40;
    pub const LOOP: u8 = 0x03;
    pub const BR: u8 = 0x0c;
    pub const END: u8 = 0x0b;
    pub const CALL: u8 = 0x10;
    pub const DROP: u8 = 0x1a;
    pub const I32_CONST: u8 = 0x41;
    pub const LOCAL_GET: u8 = 0x20;
    pub const I32_LOAD: u8 = 0x28;
    pub const I32_STORE: u8 = 0x36;
    pub const I32_ADD: u8 = 0x6a;
    pub const I32_SUB: u8 = 0x6b;
}

fn uleb(mut n: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn sleb(mut n: i32, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        let done = (n == 0 && byte & 0x40 == 0) || (n == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn name(s: &str, out: &mut Vec<u8>) {
    uleb(s.len() as u32, out);
    out.extend_from_slice(s.as_bytes());
}

/// `i32.const value`
pub fn i32_const(value: i32) -> Vec<u8> {
    let mut out = vec![op::I32_CONST];
    sleb(value, &mut out);
    out
}

/// `call index`
pub fn call(index: u32) -> Vec<u8> {
    let mut out = vec![op::CALL];
    uleb(index, &mut out);
    out
}

/// `local.get index`
pub fn local_get(index: u32) -> Vec<u8> {
    let mut out = vec![op::LOCAL_GET];
    uleb(index, &mut out);
    out
}

/// `i32.load` / `i32.store` with 4-byte alignment and a static offset
fn mem_op(opcode: u8, offset: u32) -> Vec<u8> {
    let mut out = vec![opcode, 0x02];
    uleb(offset, &mut out);
    out
}

#[derive(Default)]
pub struct WasmBuilder {
    types: Vec<Vec<u8>>,
    imports: Vec<Vec<u8>>,
    imported_funcs: u32,
    funcs: Vec<u32>,
    bodies: Vec<Vec<u8>>,
    exports: Vec<Vec<u8>>,
    memory_pages: Option<u32>,
    data: Vec<Vec<u8>>,
}

impl WasmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn func_type(&mut self, params: &[u8], results: &[u8]) -> u32 {
        let mut ty = vec![0x60];
        uleb(params.len() as u32, &mut ty);
        ty.extend_from_slice(params);
        uleb(results.len() as u32, &mut ty);
        ty.extend_from_slice(results);
        self.types.push(ty);
        self.types.len() as u32 - 1
    }

    /// Must be called before any `func`
    pub fn import_func(&mut self, module: &str, field: &str, ty: u32) -> u32 {
        let mut import = Vec::new();
        name(module, &mut import);
        name(field, &mut import);
        import.push(0x00);
        uleb(ty, &mut import);
        self.imports.push(import);
        self.imported_funcs += 1;
        self.imported_funcs - 1
    }

    /// Memory exported as `memory`
    pub fn memory(&mut self, pages: u32) -> &mut Self {
        self.memory_pages = Some(pages);
        let mut export = Vec::new();
        name("memory", &mut export);
        export.push(0x02);
        uleb(0, &mut export);
        self.exports.push(export);
        self
    }

    /// `code` holds the instructions including the final `end`
    pub fn func(&mut self, ty: u32, code: &[u8]) -> u32 {
        self.funcs.push(ty);
        let mut body = vec![0x00];
        body.extend_from_slice(code);
        self.bodies.push(body);
        self.imported_funcs + self.funcs.len() as u32 - 1
    }

    pub fn export_func(&mut self, field: &str, index: u32) -> &mut Self {
        let mut export = Vec::new();
        name(field, &mut export);
        export.push(0x00);
        uleb(index, &mut export);
        self.exports.push(export);
        self
    }

    pub fn data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        let mut segment = vec![0x00];
        segment.extend(i32_const(offset));
        segment.push(op::END);
        uleb(bytes.len() as u32, &mut segment);
        segment.extend_from_slice(bytes);
        self.data.push(segment);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
        let mut section = |id: u8, items: Vec<Vec<u8>>| {
            if items.is_empty() {
                return;
            }
            let mut content = Vec::new();
            uleb(items.len() as u32, &mut content);
            for item in items {
                content.extend(item);
            }
            out.push(id);
            uleb(content.len() as u32, &mut out);
            out.extend(content);
        };

        section(1, self.types.clone());
        section(2, self.imports.clone());
        section(
            3,
            self.funcs
                .iter()
                .map(|&ty| {
                    let mut v = Vec::new();
                    uleb(ty, &mut v);
                    v
                })
                .collect(),
        );
        if let Some(pages) = self.memory_pages {
            let mut limits = vec![0x00];
            uleb(pages, &mut limits);
            section(5, vec![limits]);
        }
        section(7, self.exports.clone());
        section(
            10,
            self.bodies
                .iter()
                .map(|body| {
                    let mut v = Vec::new();
                    uleb(body.len() as u32, &mut v);
                    v.extend_from_slice(body);
                    v
                })
                .collect(),
        );
        section(11, self.data.clone());
        out
    }
}

/// Guest whose `_start` calls `proc_exit(code)`
pub fn exit_guest(code: i32) -> Vec<u8> {
    let mut b = WasmBuilder::new();
    let exit_ty = b.func_type(&[I32], &[]);
    let start_ty = b.func_type(&[], &[]);
    let proc_exit = b.import_func("wasi_snapshot_preview1", "proc_exit", exit_ty);
    b.memory(1);
    let mut code_bytes = i32_const(code);
    code_bytes.extend(call(proc_exit));
    code_bytes.push(op::END);
    let start = b.func(start_ty, &code_bytes);
    b.export_func("_start", start);
    b.build()
}

/// Guest that writes `text` to stdout and returns from `_start`
pub fn hello_guest(text: &[u8]) -> Vec<u8> {
    let mut b = WasmBuilder::new();
    let write_ty = b.func_type(&[I32, I32, I32, I32], &[I32]);
    let start_ty = b.func_type(&[], &[]);
    let fd_write = b.import_func("wasi_snapshot_preview1", "fd_write", write_ty);
    b.memory(1);
    // iovec at 0 -> text at 64; nwritten at 32
    let mut iovec = 64u32.to_le_bytes().to_vec();
    iovec.extend((text.len() as u32).to_le_bytes());
    b.data(0, &iovec);
    b.data(64, text);

    let mut code = Vec::new();
    code.extend(i32_const(1));
    code.extend(i32_const(0));
    code.extend(i32_const(1));
    code.extend(i32_const(32));
    code.extend(call(fd_write));
    code.push(op::DROP);
    code.push(op::END);
    let start = b.func(start_ty, &code);
    b.export_func("_start", start);
    b.build()
}

/// Guest that calls `sched_yield` forever
pub fn spinning_guest() -> Vec<u8> {
    let mut b = WasmBuilder::new();
    let yield_ty = b.func_type(&[], &[I32]);
    let start_ty = b.func_type(&[], &[]);
    let sched_yield = b.import_func("wasi_snapshot_preview1", "sched_yield", yield_ty);
    b.memory(1);
    let mut code = vec![op::LOOP, op::BLOCK_VOID];
    code.extend(call(sched_yield));
    code.extend([op::DROP, op::BR, 0x00, op::END, op::END]);
    let start = b.func(start_ty, &code);
    b.export_func("_start", start);
    b.build()
}

/// Module with memory but no entrypoint
pub fn library_module() -> Vec<u8> {
    let mut b = WasmBuilder::new();
    b.memory(1);
    b.build()
}

/// Message the engine fixture logs from its terminal constructor
const ENGINE_LOG_MESSAGE: &[u8] = b"terminal created";

/// A VT engine exposing the ghostty exports with canned answers.
///
/// Allocation is a bump pointer kept at address 0. Every terminal is 2x1.
/// With `matching_cell` the viewport copies one inverse cell carrying
/// explicit colors 0x112233/0x445566 into the caller's buffer; without it the
/// viewport reports 16 bytes and leaves them zeroed.
pub fn vt_engine_module(matching_cell: bool) -> Vec<u8> {
    const CELL_AT: i32 = 512;
    const LOG_AT: i32 = 256;

    let mut b = WasmBuilder::new();
    let log_ty = b.func_type(&[I32, I32], &[]);
    let log = b.import_func("env", "log", log_ty);
    b.memory(1);
    b.data(0, &1024u32.to_le_bytes());
    b.data(LOG_AT, ENGINE_LOG_MESSAGE);
    let mut cell = (b'X' as u32).to_le_bytes().to_vec();
    cell.extend([0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x58, 1, 0, 0, 0, 0]);
    b.data(CELL_AT, &cell);

    let returning = |value: i32| {
        let mut code = i32_const(value);
        code.push(op::END);
        code
    };

    let t_i = b.func_type(&[I32], &[I32]);
    let t_ii = b.func_type(&[I32, I32], &[]);
    let t_iii_i = b.func_type(&[I32, I32, I32], &[I32]);
    let t_iii = b.func_type(&[I32, I32, I32], &[]);
    let t_ii_i = b.func_type(&[I32, I32], &[I32]);
    let t_v = b.func_type(&[I32], &[]);

    // next = mem[0]; mem[0] = next + len; return next
    let mut alloc = i32_const(0);
    alloc.extend(i32_const(0));
    alloc.extend(mem_op(op::I32_LOAD, 0));
    alloc.extend(local_get(0));
    alloc.push(op::I32_ADD);
    alloc.extend(mem_op(op::I32_STORE, 0));
    alloc.extend(i32_const(0));
    alloc.extend(mem_op(op::I32_LOAD, 0));
    alloc.extend(local_get(0));
    alloc.push(op::I32_SUB);
    alloc.push(op::END);
    let alloc = b.func(t_i, &alloc);

    let free = b.func(t_ii, &[op::END]);

    let mut new_with_config = i32_const(LOG_AT);
    new_with_config.extend(i32_const(ENGINE_LOG_MESSAGE.len() as i32));
    new_with_config.extend(call(log));
    new_with_config.extend(i32_const(1));
    new_with_config.push(op::END);
    let new_with_config = b.func(t_iii_i, &new_with_config);

    let terminal_free = b.func(t_v, &[op::END]);
    let resize = b.func(t_iii, &[op::END]);
    let write = b.func(t_iii, &[op::END]);
    let update = b.func(t_i, &returning(1));
    let cols = b.func(t_i, &returning(2));
    let rows = b.func(t_i, &returning(1));
    let mark_clean = b.func(t_v, &[op::END]);

    let mut viewport = Vec::new();
    if matching_cell {
        for word in 0..4u32 {
            viewport.extend(local_get(1));
            viewport.extend(i32_const(CELL_AT + 4 * word as i32));
            viewport.extend(mem_op(op::I32_LOAD, 0));
            viewport.extend(mem_op(op::I32_STORE, 4 * word));
        }
    }
    viewport.extend(i32_const(16));
    viewport.push(op::END);
    let viewport = b.func(t_iii_i, &viewport);

    let has_response = b.func(t_i, &returning(0));
    let read_response = b.func(t_iii_i, &returning(0));
    let terminal_new = b.func(t_ii_i, &returning(1));

    for (field, index) in [
        ("ghostty_wasm_alloc_u8_array", alloc),
        ("ghostty_wasm_free_u8_array", free),
        ("ghostty_terminal_new_with_config", new_with_config),
        ("ghostty_terminal_free", terminal_free),
        ("ghostty_terminal_resize", resize),
        ("ghostty_terminal_write", write),
        ("ghostty_render_state_update", update),
        ("ghostty_render_state_get_cols", cols),
        ("ghostty_render_state_get_rows", rows),
        ("ghostty_render_state_mark_clean", mark_clean),
        ("ghostty_render_state_get_viewport", viewport),
        ("ghostty_terminal_has_response", has_response),
        ("ghostty_terminal_read_response", read_response),
        ("ghostty_terminal_new", terminal_new),
    ] {
        b.export_func(field, index);
    }
    b.build()
}
