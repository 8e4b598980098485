//! File and network syscall wrappers.
//!
//! Every wrapper clears the argument registers, stages multi-argument
//! evaluation through the stack (an argument expression may itself call
//! and clobber anything caller-saved), pops into registers in the final
//! step, and returns the raw syscall result in RAX. File descriptors are
//! closed on every exit path; failure paths return -1 (or a null pointer
//! where the result is a pointer).

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::pools::emit_mmap_const;
use crate::result::{shape_error, CodegenResult};
use crate::strings::emit_strlen;
use ailang_ast::{Node, Span};

const SYS_READ: i64 = 0;
const SYS_WRITE: i64 = 1;
const SYS_OPEN: i64 = 2;
const SYS_CLOSE: i64 = 3;
const SYS_ACCESS: i64 = 21;
const SYS_SOCKET: i64 = 41;
const SYS_CONNECT: i64 = 42;
const SYS_ACCEPT: i64 = 43;
const SYS_BIND: i64 = 49;
const SYS_LISTEN: i64 = 50;

const O_WRONLY_CREAT_TRUNC: i64 = 0x241;
const FILE_BUFFER_SIZE: i64 = 65536;

/// Route a file or socket operation; `Ok(false)` when the name is not
/// ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "ReadTextFile" => compile_read_text_file(ctx, args, span)?,
        "WriteTextFile" => compile_write_text_file(ctx, args, span)?,
        "FileExists" => compile_file_exists(ctx, args, span)?,
        "SocketCreate" => {
            ctx.asm.zero_syscall_registers();
            ctx.asm.mov_ri(Gpr::Rax, SYS_SOCKET);
            ctx.asm.mov_ri(Gpr::Rdi, 2); // AF_INET
            ctx.asm.mov_ri(Gpr::Rsi, 1); // SOCK_STREAM
            ctx.asm.mov_ri(Gpr::Rdx, 0);
            ctx.asm.syscall();
        }
        "SocketBind" => compile_sockaddr_call(ctx, args, span, SYS_BIND, "SocketBind")?,
        "SocketConnect" => compile_sockaddr_call(ctx, args, span, SYS_CONNECT, "SocketConnect")?,
        "SocketListen" => {
            let (sock, backlog) = match args {
                [s, b] => (s, b),
                _ => return shape_error("SocketListen requires socket and backlog", span),
            };
            ctx.asm.zero_syscall_registers();
            compile_expression(ctx, sock)?;
            ctx.asm.push(Gpr::Rax);
            compile_expression(ctx, backlog)?;
            ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
            ctx.asm.pop(Gpr::Rdi);
            ctx.asm.mov_ri(Gpr::Rax, SYS_LISTEN);
            ctx.asm.syscall();
        }
        "SocketAccept" => {
            let sock = match args {
                [s] => s,
                _ => return shape_error("SocketAccept requires a socket", span),
            };
            ctx.asm.zero_syscall_registers();
            compile_expression(ctx, sock)?;
            ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
            ctx.asm.mov_ri(Gpr::Rax, SYS_ACCEPT);
            ctx.asm.mov_ri(Gpr::Rsi, 0);
            ctx.asm.mov_ri(Gpr::Rdx, 0);
            ctx.asm.syscall();
        }
        "SocketRead" => compile_socket_io(ctx, args, span, SYS_READ, "SocketRead")?,
        "SocketWrite" => compile_socket_io(ctx, args, span, SYS_WRITE, "SocketWrite")?,
        "SocketClose" => {
            let sock = match args {
                [s] => s,
                _ => return shape_error("SocketClose requires a socket", span),
            };
            compile_expression(ctx, sock)?;
            ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
            ctx.asm.mov_ri(Gpr::Rax, SYS_CLOSE);
            ctx.asm.syscall();
        }
        _ => return Ok(false),
    }
    Ok(true)
}

/// `ReadTextFile(path)`: the whole file (up to 64 KiB) in a fresh
/// NUL-terminated buffer, or a null pointer when the open fails. The fd is
/// closed on the success path; the failure path never opened one.
fn compile_read_text_file(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let path = match args {
        [p] => p,
        _ => return shape_error("ReadTextFile requires a path", span),
    };
    ctx.asm.push(Gpr::Rbx);

    ctx.asm.zero_syscall_registers();
    compile_expression(ctx, path)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, SYS_OPEN);
    ctx.asm.mov_ri(Gpr::Rsi, 0); // O_RDONLY
    ctx.asm.mov_ri(Gpr::Rdx, 0);
    ctx.asm.syscall();

    let fail = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::S, fail);

    ctx.asm.push(Gpr::Rax); // fd
    emit_mmap_const(ctx, FILE_BUFFER_SIZE);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.push(Gpr::Rdi); // fd again, for close

    ctx.asm.mov_ri(Gpr::Rax, SYS_READ);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rbx);
    ctx.asm.mov_ri(Gpr::Rdx, FILE_BUFFER_SIZE - 1);
    ctx.asm.syscall();

    let read_ok = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Ns, read_ok);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(read_ok);
    ctx.asm
        .store_u8_imm(Mem::base_index_disp(Gpr::Rbx, Gpr::Rax, 0), 0);

    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.mov_ri(Gpr::Rax, SYS_CLOSE);
    ctx.asm.syscall();

    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(fail);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `WriteTextFile(path, content)`: create/truncate with mode 0644; returns
/// the bytes written or -1. The fd is closed before returning.
fn compile_write_text_file(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (path, content) = match args {
        [p, c] => (p, c),
        _ => return shape_error("WriteTextFile requires path and content", span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.push(Gpr::R12);

    compile_expression(ctx, path)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, content)?;
    ctx.asm.mov_rr(Gpr::R12, Gpr::Rax);
    ctx.asm.pop(Gpr::Rdi);

    ctx.asm.mov_ri(Gpr::Rax, SYS_OPEN);
    ctx.asm.mov_ri(Gpr::Rsi, O_WRONLY_CREAT_TRUNC);
    ctx.asm.mov_ri(Gpr::Rdx, 0o644);
    ctx.asm.syscall();

    let fail = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::S, fail);
    ctx.asm.mov_rr(Gpr::Rbx, Gpr::Rax); // fd

    ctx.asm.mov_rr(Gpr::Rdi, Gpr::R12);
    emit_strlen(ctx);
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, SYS_WRITE);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rbx);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::R12);
    ctx.asm.syscall();

    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, SYS_CLOSE);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rbx);
    ctx.asm.syscall();
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.jmp(done);

    ctx.asm.mark_label(fail);
    ctx.asm.mov_ri(Gpr::Rax, -1);
    ctx.asm.mark_label(done);
    ctx.asm.pop(Gpr::R12);
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// `FileExists(path)`: 1 when `access(path, F_OK)` succeeds, else 0.
fn compile_file_exists(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let path = match args {
        [p] => p,
        _ => return shape_error("FileExists requires a path", span),
    };
    compile_expression(ctx, path)?;
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, SYS_ACCESS);
    ctx.asm.mov_ri(Gpr::Rsi, 0);
    ctx.asm.syscall();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.setcc_bool(Cond::Z);
    Ok(())
}

/// Shared bind/connect lowering: build a `sockaddr_in` on the stack (port
/// and a non-zero address byte-swapped to network order) and issue the
/// syscall against it.
fn compile_sockaddr_call(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    syscall_no: i64,
    name: &str,
) -> CodegenResult<()> {
    let (sock, addr, port) = match args {
        [s, a, p] => (s, a, p),
        _ => return shape_error(format!("{name} requires socket, address and port"), span),
    };
    ctx.asm.push(Gpr::Rbx);
    ctx.asm.zero_syscall_registers();

    compile_expression(ctx, sock)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, addr)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, port)?;
    ctx.asm.xchg_al_ah();
    ctx.asm.pop(Gpr::Rbx); // address

    ctx.asm.sub_ri(Gpr::Rsp, 16);
    ctx.asm.store_u16_imm(Mem::base(Gpr::Rsp), 2); // AF_INET
    ctx.asm.store_u16(Mem::base_disp(Gpr::Rsp, 2), Gpr::Rax);

    let no_swap = ctx.asm.create_label();
    ctx.asm.mov_rr(Gpr::Rax, Gpr::Rbx);
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::Z, no_swap);
    ctx.asm.bswap_r32(Gpr::Rax);
    ctx.asm.mark_label(no_swap);
    ctx.asm.store_u32(Mem::base_disp(Gpr::Rsp, 4), Gpr::Rax);
    ctx.asm.store_imm32(Mem::base_disp(Gpr::Rsp, 8), 0);

    // The socket fd sits just above the sockaddr we built.
    ctx.asm.load(Gpr::Rdi, Mem::base_disp(Gpr::Rsp, 16));
    ctx.asm.mov_ri(Gpr::Rax, syscall_no);
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rsp);
    ctx.asm.mov_ri(Gpr::Rdx, 16);
    ctx.asm.syscall();

    ctx.asm.add_ri(Gpr::Rsp, 24); // sockaddr + the staged fd
    ctx.asm.pop(Gpr::Rbx);
    Ok(())
}

/// Shared read/write lowering: `fd, buffer, length` staged through the
/// stack, popped into RDI/RSI/RDX.
fn compile_socket_io(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    syscall_no: i64,
    name: &str,
) -> CodegenResult<()> {
    let (sock, buf, len) = match args {
        [s, b, l] => (s, b, l),
        _ => return shape_error(format!("{name} requires socket, buffer and length"), span),
    };
    ctx.asm.zero_syscall_registers();
    compile_expression(ctx, sock)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, buf)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, len)?;
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rsi);
    ctx.asm.pop(Gpr::Rdi);
    ctx.asm.mov_ri(Gpr::Rax, syscall_no);
    ctx.asm.syscall();
    Ok(())
}
