#[ctor::ctor(anonymous)]
fn test_init() {
    let _ = env_logger::builder()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .format_level(true)
        .format_module_path(false)
        .format_timestamp_micros()
        .is_test(true)
        .try_init();

    // keep process-quit unwinds off stderr
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if info.payload().is::<crate::sched::ThreadExit>() {
            return;
        }
        default_hook(info);
    }));
}
