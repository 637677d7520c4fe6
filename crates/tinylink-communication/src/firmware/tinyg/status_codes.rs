//! TinyG status code decoder
//! Converts the numeric status codes in response footers and error reports
//! to human-readable messages

/// Status code for a successful command
pub const STATUS_OK: u16 = 0;
/// Status code for a command that did nothing (blank line, comment)
pub const STATUS_NOOP: u16 = 3;

/// True if a footer status means the command was accepted
pub fn is_success(code: u16) -> bool {
    matches!(code, STATUS_OK | STATUS_NOOP)
}

/// Decode a TinyG status code to a human-readable message
pub fn decode_status(code: u16) -> &'static str {
    match code {
        0 => "OK",
        1 => "Generic error",
        2 => "Function would block here (call again)",
        3 => "Function had no-operation",
        4 => "Operation is complete",
        5 => "Operation terminated (gracefully)",
        6 => "Operation was hard reset",
        7 => "Function returned end-of-line",
        8 => "Function returned end-of-file",
        9 => "File is not open",
        10 => "File size exceeded",
        11 => "No such device",
        12 => "Buffer is empty",
        13 => "Buffer is full",
        14 => "Buffer is full - fatal",
        15 => "Initializing - not ready for use",
        16 => "Entering boot loader",
        17 => "Function is stubbed",
        20 => "Internal error",
        21 => "Internal range error",
        22 => "Floating point error",
        23 => "Divide by zero",
        24 => "Invalid address",
        25 => "Read-only address",
        26 => "Initialization failure",
        27 => "System alarmed",
        28 => "Failed to get planner buffer",
        29 => "Generic exception report",
        30 => "Move time is infinite",
        31 => "Move time is NAN",
        32 => "Float is infinite",
        33 => "Float is NAN",
        34 => "Persistence error",
        35 => "Bad status report setting",
        100 => "Unrecognized command or config name",
        101 => "Invalid or malformed command",
        102 => "Bad number format",
        103 => "Unsupported value type",
        104 => "Parameter is read-only",
        105 => "Parameter cannot be read",
        106 => "Command not accepted at this time",
        107 => "Input exceeds max length",
        108 => "Input less than minimum value",
        109 => "Input exceeds maximum value",
        110 => "Input value range error",
        111 => "JSON syntax error",
        112 => "JSON input has too many pairs",
        113 => "JSON string too long",
        130 => "Generic G-code input error",
        131 => "G-code command unsupported",
        132 => "M code unsupported",
        133 => "G-code modal group violation",
        134 => "Axis word missing",
        135 => "Axis cannot be present",
        136 => "Axis is invalid for this command",
        137 => "Axis is disabled",
        138 => "Axis target position is missing",
        139 => "Axis target position is invalid",
        140 => "Selected plane is missing",
        141 => "Selected plane is invalid",
        142 => "Feedrate not specified",
        143 => "Inverse time mode cannot be used with this command",
        144 => "Rotary axes cannot be used with this command",
        145 => "G0 or G1 must be active for G53",
        146 => "Requested velocity exceeds limits",
        147 => "Cutter compensation cannot be enabled",
        148 => "Programmed point same as current point",
        149 => "Spindle speed below minimum",
        150 => "Spindle speed exceeded maximum",
        151 => "S word is missing",
        152 => "S word is invalid",
        153 => "Spindle must be off for this command",
        154 => "Spindle must be turning for this command",
        155 => "Arc specification error",
        200 => "Move less than minimum length",
        201 => "Move less than minimum time",
        202 => "Machine is alarmed - command not processed",
        203 => "Limit switch hit - shutdown occurred",
        204 => "Trapezoid planner failed to converge",
        220 => "Soft limit exceeded",
        240 => "Homing cycle failed",
        241 => "Homing error - bad or no axis specified",
        242 => "Homing error - switch misconfiguration",
        243 => "Homing error - zero search velocity",
        244 => "Homing error - zero latch velocity",
        245 => "Homing error - travel min and max are the same",
        246 => "Homing error - negative latch backoff",
        247 => "Homing error - homing switches misconfigured",
        250 => "Probe cycle failed",
        251 => "Probe endpoint is starting point",
        252 => "Jogging cycle failed",
        _ => "Unknown status code",
    }
}

/// Format a status code as "message (code)"
pub fn format_status(code: u16) -> String {
    format!("{} ({})", decode_status(code), code)
}
