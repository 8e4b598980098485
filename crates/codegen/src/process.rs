//! Process-management syscall wrappers: fork, exec, wait, signals, pipes
//! and sleep.
//!
//! The same staging discipline as the file/socket wrappers applies:
//! multi-argument operands ride the stack while later arguments evaluate,
//! and the raw syscall result stays in RAX.

use crate::asm::{Cond, Gpr, Mem};
use crate::context::Context;
use crate::expr::compile_expression;
use crate::pools::emit_mmap_const;
use crate::result::{shape_error, CodegenResult};
use ailang_ast::{Node, Span};

const SYS_READ: i64 = 0;
const SYS_WRITE: i64 = 1;
const SYS_PIPE: i64 = 22;
const SYS_NANOSLEEP: i64 = 35;
const SYS_GETPID: i64 = 39;
const SYS_FORK: i64 = 57;
const SYS_EXECVE: i64 = 59;
const SYS_EXIT: i64 = 60;
const SYS_WAIT4: i64 = 61;
const SYS_KILL: i64 = 62;
const SYS_GETTID: i64 = 186;

/// Route a process operation; `Ok(false)` when the name is not ours.
pub(crate) fn compile_operation(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<bool> {
    match function {
        "ProcessFork" => {
            // Child PID in the parent, 0 in the child, negative errno on
            // failure.
            ctx.asm.mov_ri(Gpr::Rax, SYS_FORK);
            ctx.asm.syscall();
        }
        "ProcessGetPID" => {
            ctx.asm.mov_ri(Gpr::Rax, SYS_GETPID);
            ctx.asm.syscall();
        }
        "ProcessGetTID" => {
            ctx.asm.mov_ri(Gpr::Rax, SYS_GETTID);
            ctx.asm.syscall();
        }
        "ProcessExit" => {
            let status = match args {
                [status] => status,
                _ => return shape_error("ProcessExit requires a status code", span),
            };
            compile_expression(ctx, status)?;
            ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
            ctx.asm.mov_ri(Gpr::Rax, SYS_EXIT);
            ctx.asm.syscall();
        }
        "ProcessWait" => compile_process_wait(ctx, args, span)?,
        "ProcessKill" => {
            let (pid, signal) = match args {
                [pid, signal] => (pid, signal),
                _ => return shape_error("ProcessKill requires pid and signal", span),
            };
            compile_expression(ctx, pid)?;
            ctx.asm.push(Gpr::Rax);
            compile_expression(ctx, signal)?;
            ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
            ctx.asm.pop(Gpr::Rdi);
            ctx.asm.mov_ri(Gpr::Rax, SYS_KILL);
            ctx.asm.syscall();
        }
        "ProcessExec" => {
            // Does not return on success; the negated errno comes back on
            // failure. The argv block is a NUL-terminated pointer array
            // the program builds itself.
            let (path, argv) = match args {
                [path, argv] => (path, argv),
                _ => return shape_error("ProcessExec requires path and argv", span),
            };
            compile_expression(ctx, path)?;
            ctx.asm.push(Gpr::Rax);
            compile_expression(ctx, argv)?;
            ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rax);
            ctx.asm.pop(Gpr::Rdi);
            ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
            ctx.asm.mov_ri(Gpr::Rax, SYS_EXECVE);
            ctx.asm.syscall();
        }
        "PipeCreate" => compile_pipe_create(ctx)?,
        "PipeRead" => compile_pipe_io(ctx, args, span, SYS_READ, 0, "PipeRead")?,
        "PipeWrite" => compile_pipe_io(ctx, args, span, SYS_WRITE, 8, "PipeWrite")?,
        "ProcessSleep" => compile_process_sleep(ctx, args, span)?,
        _ => return Ok(false),
    }
    Ok(true)
}

/// `ProcessWait(pid, options)`: `wait4` with an on-stack status word and
/// no rusage; the exited child's PID (or negative errno) in RAX.
fn compile_process_wait(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let (pid, options) = match args {
        [pid, options] => (pid, options),
        _ => return shape_error("ProcessWait requires pid and options", span),
    };
    compile_expression(ctx, pid)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, options)?;
    ctx.asm.push(Gpr::Rax);
    ctx.asm.sub_ri(Gpr::Rsp, 8); // status word
    ctx.asm.mov_rr(Gpr::Rsi, Gpr::Rsp);
    ctx.asm.load(Gpr::R10, Mem::base_disp(Gpr::Rsp, 8));
    ctx.asm.load(Gpr::Rdi, Mem::base_disp(Gpr::Rsp, 16));
    ctx.asm.xor_rr(Gpr::Rdx, Gpr::Rdx);
    ctx.asm.mov_ri(Gpr::Rax, SYS_WAIT4);
    ctx.asm.syscall();
    ctx.asm.add_ri(Gpr::Rsp, 24);
    Ok(())
}

/// `PipeCreate()`: a 16-byte heap block holding `[read_fd][write_fd]`, or
/// a null pointer when the pipe syscall fails.
fn compile_pipe_create(ctx: &mut Context) -> CodegenResult<()> {
    emit_mmap_const(ctx, 16);
    ctx.asm.push(Gpr::Rax);
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rax);
    ctx.asm.mov_ri(Gpr::Rax, SYS_PIPE);
    ctx.asm.syscall();

    let fail = ctx.asm.create_label();
    let done = ctx.asm.create_label();
    ctx.asm.test_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.jcc(Cond::S, fail);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.jmp(done);
    ctx.asm.mark_label(fail);
    ctx.asm.add_ri(Gpr::Rsp, 8);
    ctx.asm.xor_rr(Gpr::Rax, Gpr::Rax);
    ctx.asm.mark_label(done);
    Ok(())
}

/// Shared pipe read/write: the fd loads through the handle block at the
/// given offset (read end at 0, write end at 8).
fn compile_pipe_io(
    ctx: &mut Context,
    args: &[Node],
    span: Span,
    syscall_no: i64,
    fd_offset: i32,
    name: &str,
) -> CodegenResult<()> {
    let (handle, buffer, length) = match args {
        [handle, buffer, length] => (handle, buffer, length),
        _ => return shape_error(format!("{name} requires handle, buffer and length"), span),
    };
    compile_expression(ctx, handle)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, buffer)?;
    ctx.asm.push(Gpr::Rax);
    compile_expression(ctx, length)?;
    ctx.asm.mov_rr(Gpr::Rdx, Gpr::Rax);
    ctx.asm.pop(Gpr::Rsi);
    ctx.asm.pop(Gpr::Rax);
    ctx.asm.load(Gpr::Rdi, Mem::base_disp(Gpr::Rax, fd_offset));
    ctx.asm.mov_ri(Gpr::Rax, syscall_no);
    ctx.asm.syscall();
    Ok(())
}

/// `ProcessSleep(seconds)`: `nanosleep` against an on-stack timespec.
fn compile_process_sleep(ctx: &mut Context, args: &[Node], span: Span) -> CodegenResult<()> {
    let seconds = match args {
        [seconds] => seconds,
        _ => return shape_error("ProcessSleep requires a second count", span),
    };
    compile_expression(ctx, seconds)?;
    ctx.asm.sub_ri(Gpr::Rsp, 16);
    ctx.asm.store(Mem::base(Gpr::Rsp), Gpr::Rax); // tv_sec
    ctx.asm.store_imm32(Mem::base_disp(Gpr::Rsp, 8), 0); // tv_nsec
    ctx.asm.mov_rr(Gpr::Rdi, Gpr::Rsp);
    ctx.asm.xor_rr(Gpr::Rsi, Gpr::Rsi);
    ctx.asm.mov_ri(Gpr::Rax, SYS_NANOSLEEP);
    ctx.asm.syscall();
    ctx.asm.add_ri(Gpr::Rsp, 16);
    Ok(())
}
