use mazurka_core::prelude::*;

fn main() -> std::io::Result<()> {
    mazurka_core::logging::init();

    let server = Server::create(Config::from_env());

    server
        .add_route(Route::new("/hello").unwrap().get(
            |_: &mut Request, _: &Params| -> Result<Response> {
                Ok(Response::text("Hello, World!"))
            },
        ))
        .expect("fresh route table");

    server
        .add_route(Route::new("/hello/:name").unwrap().get(
            |_: &mut Request, params: &Params| -> Result<Response> {
                let name = params.get("name").unwrap_or("world");
                Ok(Response::text(format!("Hello, {name}!")))
            },
        ))
        .expect("fresh route table");

    server
        .add_route(Route::new("/stream").unwrap().get(
            |_: &mut Request, _: &Params| -> Result<Response> {
                Ok(Response::stream(|| {
                    (0..5).map(|i| format!("tick {i}\n").into_bytes())
                }))
            },
        ))
        .expect("fresh route table");

    server
        .after("/*all", |_: &Params, r: Response| {
            Ok(r.with_header("Server", "mazurka"))
        })
        .expect("valid pattern");

    server.start("127.0.0.1:8080")
}
