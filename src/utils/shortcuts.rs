/// Build an `Invocation` from a program and a list of arguments, each converted with `to_string`
#[macro_export]
macro_rules! invocation {
    ($program:expr $(, $arg:expr)* $(,)?) => {
        $crate::engine::runner::Invocation::new($program)$(.arg($arg))*
    };
}

/// Readiness check that passes when the command exits zero
#[macro_export]
macro_rules! exit_zero {
    ($invocation:expr) => {
        $crate::engine::poller::Check::Command {
            invocation: $invocation,
            expect: $crate::engine::poller::Expect::ExitZero,
        }
    };
}

/// Readiness check that passes when the command exits zero and stdout contains the text
#[macro_export]
macro_rules! output_contains {
    ($invocation:expr, $text:expr) => {
        $crate::engine::poller::Check::Command {
            invocation: $invocation,
            expect: $crate::engine::poller::Expect::Contains(String::from($text)),
        }
    };
}
