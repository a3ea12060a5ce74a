use guard_bot_commons::*;

fn main() {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "WARN,union_guard_bot=debug");
    }
    start_everything(union_guard_bot::entry());
}
