mod app;
mod registry;
mod replies;
mod store;
mod thread;
mod types;
mod widget;

#[tokio::main]
async fn main() {
    app::run().await;
}
