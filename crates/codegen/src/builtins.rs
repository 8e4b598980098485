//! The built-in operation names the backend lowers directly.
//!
//! The semantic analyzer uses this list to tell "call to a function that
//! will exist later" apart from "call to nothing at all", and the
//! orchestrator's dispatch table routes through the same names.

/// True if `name` is an operation the backend lowers itself.
pub fn is_builtin(name: &str) -> bool {
    // The user-mode VM families dispatch by prefix.
    if name.starts_with("PageTable_")
        || name.starts_with("VirtualMemory_")
        || name.starts_with("Cache_")
        || name.starts_with("TLB_")
        || name.starts_with("MemoryBarrier_")
    {
        return true;
    }
    matches!(
        name,
        // Arithmetic
        "Add" | "Subtract" | "Multiply" | "Divide" | "Modulo" | "Power"
        // Bitwise
        | "BitwiseAnd" | "BitwiseOr" | "BitwiseXor" | "BitwiseNot"
        | "LeftShift" | "RightShift"
        // Comparison
        | "LessThan" | "GreaterThan" | "LessEqual" | "GreaterEqual"
        | "EqualTo" | "NotEqual"
        // Math
        | "Abs" | "Sign" | "Min" | "Max" | "Clamp" | "Saturate" | "Pow"
        | "ISqrt" | "Floor" | "Ceil" | "Round" | "RoundEven" | "Trunc"
        | "Frac" | "FloorDivide" | "Remainder" | "FusedMultiplyAdd"
        | "Hypotenuse" | "Lerp" | "PopCount" | "CountLeadingZeros"
        | "CountTrailingZeros" | "RotateLeft" | "RotateRight" | "ByteSwap"
        | "AlignUp" | "AlignDown" | "IsPowerOfTwo" | "NextPowerOfTwo"
        | "FloorLog2" | "DegToRad" | "RadToDeg" | "Sin" | "Cos" | "Tan"
        | "Asin" | "Acos" | "Atan" | "Atan2" | "Exp" | "Exp2" | "Expm1"
        | "Log" | "Log2" | "Log10" | "Log1p"
        // Atomics
        | "AtomicAdd"
        // Processes and pipes
        | "ProcessFork" | "ProcessGetPID" | "ProcessGetTID" | "ProcessExit"
        | "ProcessWait" | "ProcessKill" | "ProcessExec" | "ProcessSleep"
        | "PipeCreate" | "PipeRead" | "PipeWrite"
        // Logical
        | "And" | "Or" | "Not"
        // Printing
        | "PrintNumber" | "PrintString" | "PrintMessage"
        // Strings
        | "StringConcat" | "StringCompare" | "StringEquals" | "StringLength"
        | "NumberToString" | "StringToNumber" | "StringToUpper"
        | "StringToLower" | "StringSubstring" | "StringCharAt"
        | "StringIndexOf" | "StringSplit" | "StringReplace"
        // Memory
        | "Allocate" | "Deallocate" | "MemCopy" | "MemSet" | "GetByte"
        | "SetByte" | "Dereference" | "AddressOf" | "SizeOf"
        | "MemCompare" | "MemChr"
        // Hash table
        | "HashCreate" | "HashSet" | "HashGet" | "HashExists" | "HashDelete"
        // Syscalls, files, sockets
        | "SystemCall" | "ReadTextFile" | "WriteTextFile" | "FileExists"
        | "SocketCreate" | "SocketBind" | "SocketListen" | "SocketAccept"
        | "SocketConnect" | "SocketRead" | "SocketWrite" | "SocketClose"
        // Scheduling
        | "LoopSpawn" | "LoopYield" | "LoopGetACB" | "LoopGetCurrentActor"
        | "LoopSetCurrentActor"
        // Linkage pools
        | "AllocateLinkage"
    )
}
