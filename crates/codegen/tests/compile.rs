//! End-to-end compilation tests: whole programs in, executable images out.
//!
//! These tests cannot run the produced executables, so they assert on the
//! properties that are visible in the bytes: determinism, ELF shape,
//! which lowering fired, and the error behavior of malformed programs.

use ailang_ast::{Case, CatchClause, Node, Parameter, PoolItem, Program, Span};
use ailang_codegen::{compile_program, compile_to_buffers, CodegenError, Options};

fn compile(program: &Program) -> Vec<u8> {
    compile_program(program, Options::default(), None).unwrap()
}

fn code_of(program: &Program) -> Vec<u8> {
    compile_to_buffers(program, Options::default(), None).unwrap().0
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn print_sum_program() -> Program {
    Program {
        declarations: vec![Node::call(
            "PrintNumber",
            vec![Node::call(
                "Add",
                vec![
                    Node::number(2),
                    Node::call("Multiply", vec![Node::number(3), Node::number(4)]),
                ],
            )],
        )],
    }
}

#[test]
fn output_bytes_are_deterministic() {
    let program = print_sum_program();
    let a = compile(&program);
    let b = compile(&program);
    assert_eq!(a, b);
}

#[test]
fn image_is_a_two_segment_elf_executable() {
    let image = compile(&print_sum_program());
    assert_eq!(&image[0..4], b"\x7FELF");
    assert_eq!(u16::from_le_bytes([image[16], image[17]]), 2); // ET_EXEC
    assert_eq!(u16::from_le_bytes([image[56], image[57]]), 2); // two phdrs
    let entry = u64::from_le_bytes(image[24..32].try_into().unwrap());
    assert_eq!(entry, 0x401000);
}

#[test]
fn countdown_loop_compiles() {
    let program = Program {
        declarations: vec![
            Node::assign("x", Node::number(10)),
            Node::While {
                condition: Box::new(Node::call(
                    "GreaterThan",
                    vec![Node::ident("x"), Node::number(0)],
                )),
                body: vec![
                    Node::call("PrintNumber", vec![Node::ident("x")]),
                    Node::assign(
                        "x",
                        Node::call("Subtract", vec![Node::ident("x"), Node::number(1)]),
                    ),
                ],
            },
        ],
    };
    let code = code_of(&program);
    // The loop needs at least one backward conditional structure: a JE to
    // the loop end and a JMP back to the condition.
    assert!(contains(&code, &[0x0F, 0x84])); // JE rel32
}

#[test]
fn branch_with_eight_integer_cases_uses_binary_search() {
    let values = [1i64, 2, 3, 5, 8, 13, 21, 34];
    let cases: Vec<Case> = values
        .iter()
        .map(|&v| Case {
            value: Node::number(v),
            body: vec![Node::call("PrintNumber", vec![Node::number(v)])],
        })
        .collect();
    let program = Program {
        declarations: vec![
            Node::assign("x", Node::number(13)),
            Node::Branch {
                expression: Box::new(Node::ident("x")),
                cases,
                default: vec![Node::call("PrintNumber", vec![Node::number(0)])],
            },
        ],
    };
    let code = code_of(&program);
    // The binary-search lowering loads every case value into RCX for its
    // CMP node; the linear form never touches RCX that way.
    for v in values {
        let mut movabs_rcx = vec![0x48, 0xB9];
        movabs_rcx.extend_from_slice(&v.to_le_bytes());
        assert!(contains(&code, &movabs_rcx), "no comparison for case {v}");
    }
    // The median case is compared before dispatch; JL appears only in the
    // search tree.
    assert!(contains(&code, &[0x0F, 0x8C])); // JL rel32
}

#[test]
fn branch_below_threshold_stays_linear() {
    let cases: Vec<Case> = (1..=3)
        .map(|v| Case {
            value: Node::number(v),
            body: vec![],
        })
        .collect();
    let program = Program {
        declarations: vec![Node::Branch {
            expression: Box::new(Node::number(2)),
            cases,
            default: vec![],
        }],
    };
    let code = code_of(&program);
    assert!(!contains(&code, &[0x0F, 0x8C]), "linear form must not emit JL");
}

#[test]
fn division_by_table_constant_avoids_idiv() {
    let program = Program {
        declarations: vec![Node::assign(
            "q",
            Node::call("Divide", vec![Node::number(12345), Node::number(1000)]),
        )],
    };
    let code = code_of(&program);
    assert!(!contains(&code, &[0x48, 0xF7, 0xFB]), "IDIV RBX present");
    // The magic constant for 1000 is embedded in a MOVABS R11.
    let mut movabs = vec![0x49, 0xBB];
    movabs.extend_from_slice(&0x20C49BA5E353F7CFu64.to_le_bytes());
    assert!(contains(&code, &movabs));
}

#[test]
fn fixed_pool_variables_load_through_r15() {
    let program = Program {
        declarations: vec![
            Node::Pool {
                pool_type: "FixedPool".to_string(),
                name: "Cfg".to_string(),
                body: vec![PoolItem {
                    key: "max".to_string(),
                    value: Some(Node::number(7)),
                    attributes: vec![],
                }],
            },
            Node::call("PrintNumber", vec![Node::ident("Cfg.max")]),
        ],
    };
    let code = code_of(&program);
    // MOV RAX, [R15] is the pool load for index 0.
    assert!(contains(&code, &[0x49, 0x8B, 0x07]));
    // The pool table is mapped with mmap (syscall 9 staged via MOVABS).
    let mut movabs_9 = vec![0x48, 0xB8];
    movabs_9.extend_from_slice(&9u64.to_le_bytes());
    assert!(contains(&code, &movabs_9));
}

#[test]
fn pool_indices_are_stable_across_runs() {
    let program = Program {
        declarations: vec![Node::Pool {
            pool_type: "FixedPool".to_string(),
            name: "S".to_string(),
            body: ["a", "b", "c"]
                .iter()
                .map(|k| PoolItem {
                    key: k.to_string(),
                    value: Some(Node::number(1)),
                    attributes: vec![],
                })
                .collect(),
        }],
    };
    assert_eq!(compile(&program), compile(&program));
}

#[test]
fn linkage_pool_field_access_compiles() {
    let program = Program {
        declarations: vec![
            Node::LinkagePoolDecl {
                name: "Point".to_string(),
                body: vec![
                    PoolItem {
                        key: "x".to_string(),
                        value: None,
                        attributes: vec![("Initialize".to_string(), Node::number(0))],
                    },
                    PoolItem {
                        key: "tag".to_string(),
                        value: None,
                        attributes: vec![("Initialize".to_string(), Node::string(""))],
                    },
                ],
            },
            Node::Function {
                name: "Store7".to_string(),
                parameters: vec![Parameter {
                    name: "p".to_string(),
                    ty: Some("LinkagePool.Point".to_string()),
                    span: Span::NONE,
                }],
                body: vec![
                    Node::assign("p.x", Node::number(7)),
                    Node::ReturnValue {
                        value: Some(Box::new(Node::ident("p.x"))),
                    },
                ],
            },
            Node::assign("blk", Node::call("AllocateLinkage", vec![Node::ident("Point")])),
            Node::assign("r", Node::call("Store7", vec![Node::ident("blk")])),
            Node::call("PrintNumber", vec![Node::ident("blk.x")]),
        ],
    };
    compile(&program);
}

#[test]
fn actor_spawn_yield_and_mailboxes_compile() {
    let program = Program {
        declarations: vec![
            Node::LoopActor {
                name: "Echo".to_string(),
                body: vec![Node::assign("got", Node::ReceiveMessage { span: Span::NONE })],
            },
            Node::assign("h", Node::call("LoopSpawn", vec![Node::string("Echo")])),
            Node::SendMessage {
                target: Box::new(Node::number(0)),
                value: Box::new(Node::number(42)),
            },
            Node::call("LoopYield", vec![]),
        ],
    };
    compile(&program);
}

#[test]
fn hash_and_string_programs_compile() {
    let program = Program {
        declarations: vec![
            Node::assign("t", Node::call("HashCreate", vec![Node::number(64)])),
            Node::call(
                "HashSet",
                vec![Node::ident("t"), Node::string("key"), Node::number(5)],
            ),
            Node::assign(
                "v",
                Node::call("HashGet", vec![Node::ident("t"), Node::string("key")]),
            ),
            Node::assign(
                "s",
                Node::call(
                    "StringConcat",
                    vec![Node::string("ping"), Node::string("pong")],
                ),
            ),
            Node::assign("n", Node::call("StringLength", vec![Node::ident("s")])),
        ],
    };
    let code = code_of(&program);
    // DJB2's seed rides in a MOVABS RAX, 5381.
    let mut seed = vec![0x48, 0xB8];
    seed.extend_from_slice(&5381u64.to_le_bytes());
    assert!(contains(&code, &seed));
}

#[test]
fn tcp_echo_program_compiles() {
    let program = Program {
        declarations: vec![
            Node::assign("s", Node::call("SocketCreate", vec![])),
            Node::call(
                "SocketBind",
                vec![Node::ident("s"), Node::number(0), Node::number(12345)],
            ),
            Node::call("SocketListen", vec![Node::ident("s"), Node::number(1)]),
            Node::assign("c", Node::call("SocketAccept", vec![Node::ident("s")])),
            Node::assign("buf", Node::call("Allocate", vec![Node::number(64)])),
            Node::assign(
                "n",
                Node::call(
                    "SocketRead",
                    vec![Node::ident("c"), Node::ident("buf"), Node::number(64)],
                ),
            ),
            Node::call(
                "SocketWrite",
                vec![Node::ident("c"), Node::ident("buf"), Node::ident("n")],
            ),
            Node::call("SocketClose", vec![Node::ident("c")]),
        ],
    };
    compile(&program);
}

#[test]
fn memcompare_uses_sse2() {
    let program = Program {
        declarations: vec![
            Node::assign("a", Node::call("Allocate", vec![Node::number(64)])),
            Node::assign("b", Node::call("Allocate", vec![Node::number(64)])),
            Node::assign(
                "r",
                Node::call(
                    "MemCompare",
                    vec![Node::ident("a"), Node::ident("b"), Node::number(64)],
                ),
            ),
        ],
    };
    let code = code_of(&program);
    assert!(contains(&code, &[0x66, 0x0F, 0x74, 0xC1])); // PCMPEQB XMM0, XMM1
    assert!(contains(&code, &[0x66, 0x0F, 0xD7, 0xC0])); // PMOVMSKB EAX, XMM0
}

#[test]
fn try_finally_is_straight_line_by_default() {
    let program = Program {
        declarations: vec![Node::Try {
            body: vec![Node::assign("x", Node::number(1))],
            catch_clauses: vec![CatchClause {
                error_type: None,
                body: vec![Node::assign("x", Node::number(2))],
            }],
            finally_body: vec![Node::assign("x", Node::number(3))],
        }],
    };
    let simplified = code_of(&program);
    let full = compile_to_buffers(
        &program,
        Options {
            full_try_catch: true,
            ..Options::default()
        },
        None,
    )
    .unwrap()
    .0;
    // The full lowering adds the error-slot bookkeeping; it must be
    // strictly larger than the straight-line form.
    assert!(full.len() > simplified.len());
}

#[test]
fn debug_level_gates_assert_snippets() {
    let program = Program {
        declarations: vec![Node::DebugAssert {
            condition: Box::new(Node::number(1)),
            message: "unreachable".to_string(),
        }],
    };
    let without = code_of(&program);
    let with = compile_to_buffers(
        &program,
        Options {
            debug_level: 2,
            ..Options::default()
        },
        None,
    )
    .unwrap()
    .0;
    assert!(with.len() > without.len());
}

#[test]
fn perf_timers_add_rdtsc_brackets() {
    let program = print_sum_program();
    let with = compile_to_buffers(
        &program,
        Options {
            perf_timers: true,
            ..Options::default()
        },
        None,
    )
    .unwrap()
    .0;
    let count = with.windows(2).filter(|w| *w == [0x0F, 0x31]).count();
    assert_eq!(count, 2, "expected RDTSC at entry and exit");
}

#[test]
fn math_program_uses_hardware_lowerings() {
    let program = Program {
        declarations: vec![
            Node::assign(
                "c",
                Node::call(
                    "Clamp",
                    vec![Node::number(150), Node::number(0), Node::number(100)],
                ),
            ),
            Node::assign("r", Node::call("ISqrt", vec![Node::number(1024)])),
            Node::assign("s", Node::call("Sin", vec![Node::number(30)])),
            Node::assign("p", Node::call("PopCount", vec![Node::ident("c")])),
        ],
    };
    let code = code_of(&program);
    assert!(contains(&code, &[0x48, 0x0F, 0x4C])); // CMOVL (clamp low bound)
    assert!(contains(&code, &[0xF2, 0x0F, 0x51, 0xC0])); // SQRTSD XMM0, XMM0
    assert!(contains(&code, &[0xD9, 0xFE])); // FSIN
    assert!(contains(&code, &[0xF3, 0x48, 0x0F, 0xB8, 0xC0])); // POPCNT RAX, RAX
}

#[test]
fn atomic_add_emits_a_locked_add() {
    let program = Program {
        declarations: vec![
            Node::assign("x", Node::number(1)),
            Node::call(
                "AtomicAdd",
                vec![Node::call("AddressOf", vec![Node::ident("x")]), Node::number(5)],
            ),
        ],
    };
    let code = code_of(&program);
    assert!(contains(&code, &[0xF0, 0x48, 0x01, 0x18])); // LOCK ADD [RAX], RBX
}

#[test]
fn fork_wait_pipe_program_compiles() {
    let program = Program {
        declarations: vec![
            Node::assign("p", Node::call("PipeCreate", vec![])),
            Node::assign("pid", Node::call("ProcessFork", vec![])),
            Node::If {
                condition: Box::new(Node::call(
                    "EqualTo",
                    vec![Node::ident("pid"), Node::number(0)],
                )),
                then_body: vec![Node::call("ProcessExit", vec![Node::number(0)])],
                else_body: vec![Node::assign(
                    "r",
                    Node::call(
                        "ProcessWait",
                        vec![Node::ident("pid"), Node::number(0)],
                    ),
                )],
            },
        ],
    };
    let code = code_of(&program);
    // fork is syscall 57, staged through the full MOVABS form.
    let mut fork = vec![0x48, 0xB8];
    fork.extend_from_slice(&57u64.to_le_bytes());
    assert!(contains(&code, &fork));
    let mut wait4 = vec![0x48, 0xB8];
    wait4.extend_from_slice(&61u64.to_le_bytes());
    assert!(contains(&code, &wait4));
}

#[test]
fn vm_simulation_and_barriers_compile() {
    let program = Program {
        declarations: vec![
            Node::assign("pt", Node::call("PageTable_Create", vec![])),
            Node::assign("va", Node::call("VirtualMemory_Allocate", vec![])),
            Node::call("MemoryBarrier_Write", vec![]),
            Node::call("TLB_FlushAll", vec![]),
        ],
    };
    let code = code_of(&program);
    assert!(contains(&code, &[0x0F, 0xAE, 0xF8])); // SFENCE
    assert!(contains(&code, &[0x0F, 0xAE, 0xF0])); // MFENCE
    // The first simulated allocation lands at the fixed base + 64 KiB.
    let mut alloc = vec![0x48, 0xB8];
    alloc.extend_from_slice(&0x4001_0000u64.to_le_bytes());
    assert!(contains(&code, &alloc));
}

#[test]
fn break_outside_loop_is_a_shape_error() {
    let program = Program {
        declarations: vec![Node::BreakLoop { span: Span::NONE }],
    };
    match compile_program(&program, Options::default(), None) {
        Err(CodegenError::Shape(d)) => assert!(d.message.contains("BreakLoop")),
        other => panic!("expected shape error, got {other:?}"),
    }
}

#[test]
fn undefined_function_is_a_semantic_error() {
    let program = Program {
        declarations: vec![Node::assign("x", Node::call("Nonsense", vec![]))],
    };
    match compile_program(&program, Options::default(), None) {
        Err(CodegenError::Semantic(diags)) => {
            assert!(diags[0].message.contains("Nonsense"));
        }
        other => panic!("expected semantic error, got {other:?}"),
    }
}

#[test]
fn duplicate_function_is_a_semantic_error() {
    let f = Node::Function {
        name: "F".to_string(),
        parameters: vec![],
        body: vec![],
    };
    let program = Program {
        declarations: vec![f.clone(), f],
    };
    match compile_program(&program, Options::default(), None) {
        Err(CodegenError::Semantic(diags)) => {
            assert!(diags[0].message.contains("duplicate"));
        }
        other => panic!("expected semantic error, got {other:?}"),
    }
}

#[test]
fn forward_function_calls_resolve() {
    let program = Program {
        declarations: vec![
            Node::assign("r", Node::call("Late", vec![Node::number(20)])),
            Node::Function {
                name: "Late".to_string(),
                parameters: vec![Parameter {
                    name: "n".to_string(),
                    ty: None,
                    span: Span::NONE,
                }],
                body: vec![Node::ReturnValue {
                    value: Some(Box::new(Node::call(
                        "Add",
                        vec![Node::ident("n"), Node::number(1)],
                    ))),
                }],
            },
        ],
    };
    // The call site precedes the body, so the CALL displacement is a
    // forward reference the relocation pass must patch.
    compile(&program);
}

#[test]
fn seven_argument_call_spills_to_the_stack() {
    let params: Vec<Parameter> = (0..7)
        .map(|i| Parameter {
            name: format!("p{i}"),
            ty: None,
            span: Span::NONE,
        })
        .collect();
    let program = Program {
        declarations: vec![
            Node::Function {
                name: "Wide".to_string(),
                parameters: params,
                body: vec![Node::ReturnValue {
                    value: Some(Box::new(Node::ident("p6"))),
                }],
            },
            Node::assign(
                "r",
                Node::call("Wide", (0..7).map(Node::number).collect()),
            ),
        ],
    };
    let code = code_of(&program);
    // The caller reclaims the stack argument after the call.
    assert!(contains(&code, &[0x48, 0x83, 0xC4, 0x08])); // ADD RSP, 8
}
