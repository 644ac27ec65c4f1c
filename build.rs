// 构建脚本: 启用 rtsp 特性时链接FFmpeg依赖库
fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_RTSP");

    if std::env::var_os("CARGO_FEATURE_RTSP").is_none() {
        return;
    }

    // 仅在Windows MSVC目标下添加FFmpeg相关库
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if target_os == "windows" && target_env == "msvc" {
        // x264 编码器
        println!("cargo:rustc-link-lib=dylib=libx264");

        // OLE 自动化和VFW
        println!("cargo:rustc-link-lib=dylib=oleaut32");
        println!("cargo:rustc-link-lib=dylib=vfw32");

        // Secure Channel (TLS/SSL, rtsps)
        println!("cargo:rustc-link-lib=dylib=secur32");
    }
}
