use std::sync::{Arc, Mutex, Once};

/// Returns a listener that accumulates every value it receives, and a function that drains them
#[allow(unused)]
pub fn watcher<T: Clone + Send + 'static>() -> (impl Fn(&T) + Send + Sync + 'static, impl Fn() -> Vec<T>) {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let accumulate = {
        let changes = changes.clone();
        move |value: &T| changes.lock().unwrap().push(value.clone())
    };

    let check = move || changes.lock().unwrap().drain(..).collect::<Vec<T>>();

    (accumulate, check)
}

#[allow(unused)]
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
    });
}
