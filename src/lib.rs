pub mod buffer_pool;
pub mod disk_manager;
pub mod errors;
pub mod indexes;
pub mod latch;
pub mod lock_manager;
pub mod pages;
pub mod txn_manager;
pub mod types;

#[macro_export]
macro_rules! printdbg {
    ($val: expr $(, $args: expr)*) => {
        #[cfg(debug_assertions)]
        println!($val $(, $args)*)
    };
}

#[macro_export]
macro_rules! get_caller_name {
    () => {{
        let mut bt = backtrace::Backtrace::new_unresolved();
        bt.resolve();
        let frames = bt.frames();
        if frames.len() > 1 {
            let caller_frame = &frames[1];
            if let Some(symbol) = caller_frame.symbols().first() {
                if let Some(name) = symbol.name() {
                    name.to_string()
                } else {
                    "Unknown Caller".to_string()
                }
            } else {
                "Unknown Caller".to_string()
            }
        } else {
            "No Caller Found".to_string() // In case the stack isn't deep enough
        }
    }};
}
