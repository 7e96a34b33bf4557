use structopt::StructOpt;

use quorum_cli::Quorum;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = Quorum::from_args().run().await {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
