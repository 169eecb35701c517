pub(crate) mod threaded_session;
