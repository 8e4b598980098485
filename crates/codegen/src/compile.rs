//! The compilation orchestrator.
//!
//! Three passes over the AST: discovery (the semantic analyzer populates
//! the symbol table so forward references always resolve), body emission
//! (functions, subroutines and actors), and the top-level pass (program
//! entry sequence, remaining statements, exit). After emission the
//! relocation pass patches every pending displacement, and the ELF writer
//! lays out the segments and produces the executable bytes.

use crate::context::{Context, Options};
use crate::result::{shape_error, CodegenError, CodegenResult};
use crate::{arith, assign, atomics, debug, expr, flow, frame, func, hashops, linkage, lowlevel,
            mathops, pools, process, sched, sema, simd, strings, sysio, vmops};
use ailang_ast::{Node, Program, Span};
use log::info;
use std::path::PathBuf;

pub use crate::context::Frontend;

/// Compile a program into a standalone ELF executable image.
///
/// `frontend` supplies parsed ASTs for `Library` loads; pass `None` when
/// the program uses no libraries.
pub fn compile_program(
    program: &Program,
    options: Options,
    frontend: Option<&dyn Frontend>,
) -> CodegenResult<Vec<u8>> {
    let mut ctx = Context::new(options, frontend);

    // Pass 1: discovery.
    sema::analyze(&mut ctx, program);
    if !ctx.diagnostics.is_empty() {
        return Err(CodegenError::Semantic(std::mem::take(&mut ctx.diagnostics)));
    }
    frame::layout_main_frame(&mut ctx, program);

    // The entry point is the first byte of the code segment; it hops over
    // the function bodies emitted by pass 2.
    let entry = ctx.asm.create_label();
    ctx.asm.jmp(entry);

    // Pass 2: function, subroutine and actor bodies.
    for decl in &program.declarations {
        match decl {
            Node::Function { name, body, .. } => {
                func::emit_function_definition(&mut ctx, name, body)?
            }
            Node::SubRoutine { name, body } => {
                func::emit_subroutine_definition(&mut ctx, name, body)?
            }
            Node::LoopActor { name, body } => sched::emit_actor_definition(&mut ctx, name, body)?,
            _ => {}
        }
    }

    // Pass 3: entry sequence, top-level statements, exit.
    ctx.asm.mark_label(entry);
    frame::emit_program_entry(&mut ctx)?;
    for decl in &program.declarations {
        match decl {
            Node::Function { .. } | Node::SubRoutine { .. } | Node::LoopActor { .. } => {}
            other => compile_node(&mut ctx, other)?,
        }
    }
    frame::emit_program_exit(&mut ctx)?;

    // Relocation pass: every jump and call placeholder must now resolve.
    ctx.asm.resolve_jumps()?;
    if ctx.binop_depth != 0 {
        return Err(CodegenError::Internal(format!(
            "binary-operator depth {} at end of emission",
            ctx.binop_depth
        )));
    }

    let image = crate::elf::write_executable(&mut ctx.asm)?;
    info!(
        "compiled {} bytes of code, {} bytes of data",
        ctx.asm.code.len(),
        ctx.asm.data.len()
    );
    Ok(image)
}

/// Dispatch one statement-position node.
pub(crate) fn compile_node(ctx: &mut Context, node: &Node) -> CodegenResult<()> {
    match node {
        Node::Assignment { target, value, span } => {
            assign::compile_assignment(ctx, target, value, *span)
        }
        Node::FunctionCall {
            function,
            arguments,
            span,
        } => compile_call(ctx, function, arguments, *span),
        Node::If {
            condition,
            then_body,
            else_body,
        } => flow::compile_if(ctx, condition, then_body, else_body),
        Node::While { condition, body } => flow::compile_while(ctx, condition, body),
        Node::BreakLoop { span } => flow::compile_break(ctx, *span),
        Node::ContinueLoop { span } => flow::compile_continue(ctx, *span),
        Node::Branch {
            expression,
            cases,
            default,
        } => flow::compile_branch(ctx, expression, cases, default),
        Node::Try {
            body,
            catch_clauses,
            finally_body,
        } => flow::compile_try(ctx, body, catch_clauses, finally_body),
        Node::ReturnValue { value } => func::compile_return(ctx, value.as_deref()),
        Node::RunTask { name, span } => func::compile_run_task(ctx, name, *span),
        Node::SendMessage { target, value } => sched::compile_send_message(ctx, target, value),
        Node::ReceiveMessage { .. } => sched::compile_receive_message(ctx),
        Node::Pool {
            pool_type,
            name,
            body,
        } => pools::compile_pool(ctx, pool_type, name, body),
        // Linkage pools are pure type declarations; discovery recorded the
        // layout and there is nothing to execute.
        Node::LinkagePoolDecl { .. } => Ok(()),
        Node::Library { name, span } => load_library(ctx, name, *span),
        Node::DebugAssert { condition, message } => {
            debug::compile_debug_assert(ctx, condition, message)
        }
        Node::Function { name, body, .. } => func::emit_function_definition(ctx, name, body),
        Node::SubRoutine { name, body } => func::emit_subroutine_definition(ctx, name, body),
        Node::LoopActor { name, body } => sched::emit_actor_definition(ctx, name, body),
        expression => expr::compile_expression(ctx, expression),
    }
}

/// Dispatch a call to a built-in operation or a user-defined function,
/// leaving the result in RAX.
pub(crate) fn compile_call(
    ctx: &mut Context,
    function: &str,
    args: &[Node],
    span: Span,
) -> CodegenResult<()> {
    if arith::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if mathops::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if strings::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if hashops::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if simd::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if lowlevel::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if sysio::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if atomics::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if process::compile_operation(ctx, function, args, span)? {
        return Ok(());
    }
    if vmops::compile_operation(ctx, function, args)? {
        return Ok(());
    }
    match function {
        "Allocate" => pools::compile_allocate(ctx, args, span),
        "Deallocate" => pools::compile_deallocate(ctx, args, span),
        "AllocateLinkage" => linkage::compile_allocate_linkage(ctx, args, span),
        "LoopSpawn" => sched::compile_loop_spawn(ctx, args, span),
        "LoopYield" => sched::compile_loop_yield(ctx),
        "LoopGetACB" => sched::compile_get_acb(ctx),
        "LoopGetCurrentActor" => sched::compile_get_current_actor(ctx),
        "LoopSetCurrentActor" => sched::compile_set_current_actor(ctx, args, span),
        _ => {
            if ctx.functions.contains_key(function) {
                func::compile_user_call(ctx, function, args)
            } else {
                shape_error(format!("unknown operation or function {function}"), span)
            }
        }
    }
}

/// Load and compile a standard-library file on demand.
///
/// `Library.<name>.ailang` is searched first in the current directory,
/// then under `Librarys/`. The file's declarations go through the same
/// discovery-then-emission sequence as the main program, with function
/// names prefixed by the library name; function bodies are emitted inline
/// behind their skip jumps.
fn load_library(ctx: &mut Context, name: &str, span: Span) -> CodegenResult<()> {
    if ctx.loaded_libraries.contains(name) {
        return Ok(());
    }
    let frontend = match ctx.frontend {
        Some(frontend) => frontend,
        None => {
            return Err(CodegenError::Frontend(format!(
                "no frontend available to load library {name}"
            )))
        }
    };

    let parts: Vec<&str> = name.split('.').collect();
    let stem = parts.last().copied().unwrap_or(name);
    let file_name = format!("Library.{stem}.ailang");
    let mut path = PathBuf::from(&file_name);
    if !path.exists() {
        let mut nested = PathBuf::from("Librarys");
        for part in &parts[..parts.len().saturating_sub(1)] {
            nested.push(part);
        }
        nested.push(&file_name);
        path = nested;
    }
    if !path.exists() {
        return shape_error(format!("library file not found: {}", path.display()), span);
    }
    info!("loading library {}", path.display());

    let library = frontend
        .parse_file(&path)
        .map_err(|e| CodegenError::Frontend(format!("{}: {e}", path.display())))?;

    ctx.loaded_libraries.insert(name.to_string());
    let saved_prefix = ctx.library_prefix.replace(stem.to_string());

    // Pass 1 over the library: register every symbol before any body.
    let before = ctx.diagnostics.len();
    sema::analyze(ctx, &library);
    if ctx.diagnostics.len() > before {
        let diags = ctx.diagnostics.split_off(before);
        ctx.library_prefix = saved_prefix;
        return Err(CodegenError::Semantic(diags));
    }

    // Pass 2: compile all declarations in place.
    let result = (|| {
        for decl in &library.declarations {
            compile_node(ctx, decl)?;
        }
        Ok(())
    })();
    ctx.library_prefix = saved_prefix;
    result
}

/// Compile a program and return only the raw code and data buffers, for
/// inspection in tests and tools that do not need the ELF wrapper.
pub fn compile_to_buffers(
    program: &Program,
    options: Options,
    frontend: Option<&dyn Frontend>,
) -> CodegenResult<(Vec<u8>, Vec<u8>)> {
    let image = compile_program(program, options, frontend)?;
    // Code starts one page in; data at the next page boundary after it.
    let code_len = u64::from_le_bytes(image[64 + 32..64 + 40].try_into().unwrap()) as usize;
    let data_off = u64::from_le_bytes(image[64 + 56 + 8..64 + 56 + 16].try_into().unwrap()) as usize;
    let code = image[0x1000..0x1000 + code_len].to_vec();
    let data = image[data_off..].to_vec();
    Ok((code, data))
}
